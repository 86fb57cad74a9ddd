use std::net::{Ipv4Addr, TcpListener};

use anyhow::{Context as _, Result};

/// A loopback port nobody listens on right now.
pub fn free_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).context("bind ephemeral port")?;
    Ok(listener.local_addr()?.port())
}
