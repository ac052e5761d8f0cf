//! The simplest adapter: logs every uplink, sends nothing onward.
//! Grounded on `original_source/floranet/appserver/reflector.py`, which
//! exists in the original purely as a smoke-test interface.

use tracing::info;

use crate::error::Result;
use crate::interfaces::Adapter;

pub struct Reflector;

impl Reflector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Adapter for Reflector {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn net_server_received(&self, dev_eui: u64, f_port: u8, payload: &[u8]) -> Result<()> {
        info!(
            dev_eui = format!("{:016X}", dev_eui),
            f_port, len = payload.len(), "reflector: uplink received"
        );
        Ok(())
    }
}
