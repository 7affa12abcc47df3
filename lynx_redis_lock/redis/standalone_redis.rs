use std::time::{Duration, Instant};

use crate::log::record_exception;
use crate::prelude::*;

use super::store::Store;

/// A standalone `redis-server` child process on an unused port, used by integration tests that
/// need a real backend rather than a mocked protocol.
pub struct RedisStandalone {
    /// The port the redis server is running on.
    pub port: u16,
    child: std::process::Child,
}

impl RedisStandalone {
    /// Find an unused port to run the standalone redis server on.
    pub fn find_unused_port() -> RResult<u16, AnyErr> {
        portpicker::pick_unused_port().ok_or_else(|| {
            Report::new(AnyErr).attach_printable("could not find a free port for RedisStandalone")
        })
    }

    /// Start a standalone redis server process with the given port and extra arguments. Killed
    /// on drop.
    pub async fn new_with_opts(port: u16, extra_args: Option<&[&str]>) -> RResult<Self, AnyErr> {
        let mut cmd = std::process::Command::new("redis-server");
        cmd.arg("--port").arg(port.to_string());
        if let Some(extra_args) = extra_args {
            for arg in extra_args {
                cmd.arg(arg);
            }
        }
        let child = cmd
            .spawn()
            .change_context(AnyErr)
            .attach_printable("spawning redis-server")?;

        let store = Store::new(
            format!("redis://localhost:{}", port),
            uuid::Uuid::new_v4().to_string(),
            Duration::from_secs(5),
        )?;

        let mut up = false;
        let elapsed = Instant::now();
        while !up && elapsed.elapsed() < Duration::from_secs(10) {
            up = store.ping().await;
        }

        if up {
            Ok(Self { child, port })
        } else {
            Err(Report::new(AnyErr)
                .attach_printable("RedisStandalone process not ready within 10 seconds"))
        }
    }

    /// Start a standalone redis server process on an unused port. Killed on drop.
    pub async fn new() -> RResult<Self, AnyErr> {
        Self::new_with_opts(Self::find_unused_port()?, None).await
    }

    /// Same as [`Self::new`], but disables AOF/RDB persistence, which otherwise interferes with
    /// fast repeated test runs against the same data directory.
    pub async fn new_no_persistence() -> RResult<Self, AnyErr> {
        Self::new_with_opts(
            Self::find_unused_port()?,
            Some(&["--appendonly", "no", "--save", "\"\""]),
        )
        .await
    }

    /// Connection string a client would use to reach this instance.
    pub fn client_conn_str(&self) -> String {
        format!("redis://localhost:{}", self.port)
    }

    /// Kill the server. Automatically called on drop.
    pub fn kill(mut self) {
        self.kill_inner()
    }

    fn kill_inner(&mut self) {
        if let Err(e) = self.child.kill() {
            record_exception("could not kill RedisStandalone child process", format!("{:?}", e));
        }
    }
}

impl Drop for RedisStandalone {
    fn drop(&mut self) {
        self.kill_inner()
    }
}
