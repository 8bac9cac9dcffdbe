//! Per-port configuration and the acceptance policy that produces it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::serial::PortInfo;

pub const DEFAULT_MAX_QUEUE_LENGTH: usize = 30;
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(200);

/// Extracts a device identity from a raw probe response. `None` or an empty
/// string means the response did not identify a device.
pub type IdParser = Arc<dyn Fn(&[u8]) -> Option<String> + Send + Sync>;

/// Validates a raw response buffer at quiescence.
pub type ResponseCheck = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Decides, from port metadata, whether a port is managed and how.
///
/// `None` means ignore the port. The policy is re-invoked on every
/// reconnect of the same path, so metadata changes on replug take effect.
pub type OptionPolicy = Arc<dyn Fn(&PortInfo) -> Option<PortConfig> + Send + Sync>;

/// Everything a port manager needs to drive one port.
///
/// Built with [`PortConfig::new`] plus `with_*` overrides; unset fields
/// keep their defaults. Command terminators (`\n`, `\r\n`, ...) are the
/// caller's responsibility; nothing is appended on the wire.
#[derive(Clone)]
pub struct PortConfig {
    pub baud_rate: u32,
    /// Probe sent to elicit the identity string.
    pub get_id_command: Vec<u8>,
    pub get_id_parser: IdParser,
    pub check_response: Option<ResponseCheck>,
    pub max_queue_length: usize,
    /// Quiescence window: a response is complete once the line has been
    /// silent this long.
    pub serial_response_timeout: Duration,
}

impl PortConfig {
    pub fn new(
        baud_rate: u32,
        get_id_command: impl Into<Vec<u8>>,
        get_id_parser: impl Fn(&[u8]) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            baud_rate,
            get_id_command: get_id_command.into(),
            get_id_parser: Arc::new(get_id_parser),
            check_response: None,
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
            serial_response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_check_response(
        mut self,
        check: impl Fn(&[u8]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.check_response = Some(Arc::new(check));
        self
    }

    pub fn with_max_queue_length(mut self, max_queue_length: usize) -> Self {
        self.max_queue_length = max_queue_length;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.serial_response_timeout = timeout;
        self
    }
}

impl fmt::Debug for PortConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortConfig")
            .field("baud_rate", &self.baud_rate)
            .field("get_id_command", &String::from_utf8_lossy(&self.get_id_command))
            .field("check_response", &self.check_response.is_some())
            .field("max_queue_length", &self.max_queue_length)
            .field("serial_response_timeout", &self.serial_response_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser(_: &[u8]) -> Option<String> {
        None
    }

    #[test]
    fn defaults_applied() {
        let config = PortConfig::new(115200, b"ID\n".to_vec(), parser);
        assert_eq!(config.max_queue_length, 30);
        assert_eq!(config.serial_response_timeout, Duration::from_millis(200));
        assert!(config.check_response.is_none());
    }

    #[test]
    fn overrides_win_over_defaults() {
        let config = PortConfig::new(9600, b"ID\n".to_vec(), parser)
            .with_max_queue_length(2)
            .with_response_timeout(Duration::from_millis(50))
            .with_check_response(|buf| buf.ends_with(b"\n"));
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.max_queue_length, 2);
        assert_eq!(config.serial_response_timeout, Duration::from_millis(50));
        let check = config.check_response.as_ref().map(Arc::clone);
        assert!(check.is_some_and(|c| c(b"ok\n") && !c(b"ok")));
    }
}
