//! Integration test infrastructure.
//!
//! Spawns skirmishd instances with a minimal web-only configuration and
//! gives tests a WebSocket client into them. No game-server children are
//! launched; everything exercised here lives in the orchestrator itself.

#![allow(dead_code)]

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tokio::time::sleep;

/// A spawned orchestrator under test.
pub struct TestCluster {
    child: Child,
    port: u16,
    data_dir: PathBuf,
}

impl TestCluster {
    /// Spawn an orchestrator serving only the web ingress on `port`.
    pub async fn spawn(port: u16) -> anyhow::Result<Self> {
        let data_dir = std::env::temp_dir().join(format!("skirmishd-test-{port}"));
        std::fs::create_dir_all(&data_dir)?;

        let config_path = data_dir.join("config.toml");
        let config_content = format!(
            r#"
[cluster]
server_description = "Test #id"

[cluster.ingress.web]
port = {port}

[cluster.spawn]
server_binary = "/bin/false"
working_dir = "{dir}/work"
socket_dir = "{dir}"
socket_prefix = "testsrv"

[cluster.database]
path = "{dir}/verse.db"
"#,
            dir = data_dir.display(),
        );
        std::fs::write(&config_path, config_content)?;

        let child = Command::new(env!("CARGO_BIN_EXE_skirmishd"))
            .arg(&config_path)
            .env("RUST_LOG", "warn")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let cluster = Self {
            child,
            port,
            data_dir,
        };
        cluster.wait_ready().await?;
        Ok(cluster)
    }

    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}/service", self.port)
    }

    async fn wait_ready(&self) -> anyhow::Result<()> {
        for _ in 0..100 {
            if tokio::net::TcpStream::connect(("127.0.0.1", self.port))
                .await
                .is_ok()
            {
                return Ok(());
            }
            sleep(Duration::from_millis(50)).await;
        }
        anyhow::bail!("orchestrator never bound its web ingress")
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}
