use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use pcap::{Active, Capture, Direction};

/// Read timeout for capture handles; keeps the capture thread responsive
/// to shutdown without busy polling.
pub const READ_TIMEOUT_MS: i32 = 100;

/// Open an activated capture handle on the configured interface. Windows
/// addresses adapters by NPF GUID rather than name.
pub fn open_capture(cfg: &NetworkConfig) -> Result<Capture<Active>> {
    let device = if cfg!(windows) && !cfg.guid.is_empty() {
        format!(r"\Device\NPF_{}", cfg.guid)
    } else {
        cfg.interface.clone()
    };
    let cap = Capture::from_device(device.as_str())
        .map_err(|e| Error::bind_with_source(format!("failed to open device {}", device), e))?
        .promisc(false)
        .snaplen(65535)
        .buffer_size(cfg.pcap.sockbuf as i32)
        .immediate_mode(true)
        .timeout(READ_TIMEOUT_MS)
        .open()
        .map_err(|e| Error::bind_with_source("failed to open pcap handle", e))?;
    Ok(cap)
}

/// Open the outbound injection handle.
pub fn open_send_handle(cfg: &NetworkConfig) -> Result<Capture<Active>> {
    let mut cap = open_capture(cfg)?;
    set_direction(&mut cap, Direction::Out)?;
    Ok(cap)
}

/// Open the inbound capture handle with the BPF filter installed.
pub fn open_recv_handle(cfg: &NetworkConfig, port: u16) -> Result<Capture<Active>> {
    let mut cap = open_capture(cfg)?;
    set_direction(&mut cap, Direction::In)?;
    let filter = format!("tcp and dst port {}", port);
    cap.filter(&filter, true)
        .map_err(|e| Error::bind_with_source(format!("failed to set BPF filter '{}'", filter), e))?;
    Ok(cap)
}

fn set_direction(cap: &mut Capture<Active>, dir: Direction) -> Result<()> {
    // Npcap does not fully support capture direction; skip it there.
    if cfg!(windows) {
        return Ok(());
    }
    cap.direction(dir)
        .map_err(|e| Error::bind_with_source("failed to set pcap direction", e))
}
