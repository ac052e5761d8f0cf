//! Appends each uplink as a text line to a configured file.
//! Grounded on `original_source/floranet/appserver/file_text_store.py`.

use std::path::PathBuf;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{NetServerError, Result};
use crate::interfaces::Adapter;

pub struct FileTextStore {
    path: PathBuf,
    // Serializes appends so concurrent uplinks don't interleave lines.
    lock: Mutex<()>,
}

impl FileTextStore {
    pub fn new(path: String) -> Self {
        Self {
            path: PathBuf::from(path),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait::async_trait]
impl Adapter for FileTextStore {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn net_server_received(&self, dev_eui: u64, f_port: u8, payload: &[u8]) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut line = self.marshal(dev_eui, f_port, payload);
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(NetServerError::TransientIO)?;
        file.write_all(line.as_bytes()).await.map_err(NetServerError::TransientIO)?;
        Ok(())
    }

    fn marshal(&self, dev_eui: u64, f_port: u8, payload: &[u8]) -> String {
        format!("{:016X},{},{}", dev_eui, f_port, hex::encode(payload))
    }

    fn valid(&self) -> (bool, Vec<String>) {
        if self.path.as_os_str().is_empty() {
            (false, vec!["path must not be empty".into()])
        } else {
            (true, Vec::new())
        }
    }
}
