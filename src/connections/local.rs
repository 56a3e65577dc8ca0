// Local command execution without a remote transport

use std::any::Any;
use std::process::Command;

use super::{ConnectionOptions, ConnectionPlugin};
use crate::output::errors::ConnectionError;

/// Output of a command run through a connection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs commands on the machine driving the session
#[derive(Debug, Default)]
pub struct LocalConnection {
    host_name: Option<String>,
}

impl LocalConnection {
    pub const NAME: &'static str = "local";

    pub fn new() -> Self {
        LocalConnection::default()
    }

    pub fn is_open(&self) -> bool {
        self.host_name.is_some()
    }

    /// Host this connection was opened for
    pub fn host_name(&self) -> Option<&str> {
        self.host_name.as_deref()
    }

    /// Run a command with `sh -c`
    pub fn exec(&self, cmd: &str) -> Result<CommandResult, ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::NotOpen);
        }

        let output = Command::new("sh").arg("-c").arg(cmd).output()?;

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

impl ConnectionPlugin for LocalConnection {
    fn open(&mut self, options: &ConnectionOptions) -> Result<(), ConnectionError> {
        let host = options
            .hostname
            .clone()
            .ok_or_else(|| ConnectionError::Open("no hostname given".to_string()))?;
        self.host_name = Some(host);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ConnectionError> {
        self.host_name = None;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_requires_open() {
        let conn = LocalConnection::new();
        assert!(matches!(conn.exec("true"), Err(ConnectionError::NotOpen)));
    }

    #[test]
    fn test_exec_captures_output() {
        let mut conn = LocalConnection::new();
        let opts = ConnectionOptions {
            hostname: Some("localhost".to_string()),
            ..Default::default()
        };
        conn.open(&opts).unwrap();
        assert_eq!(conn.host_name(), Some("localhost"));

        let result = conn.exec("echo hello; echo oops >&2; exit 3").unwrap();
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.stderr.trim(), "oops");
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());

        conn.close().unwrap();
        assert!(!conn.is_open());
    }
}
