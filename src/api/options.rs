use std::convert::TryFrom;
use tokio::time::Duration;

/// Tuning knobs shared by chat nodes and clients. Unset fields take their defaults.
#[derive(Clone, Default)]
pub struct ChatOptions {
    /// How long a promoted leader waits for each expected backup before giving up on it.
    pub discovery_timeout: Option<Duration>,
    /// How long an accepted connection has to send its hello frame.
    pub handshake_timeout: Option<Duration>,
    /// How long a client waits after losing its server before walking the backups.
    pub reconnect_delay: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub login_attempts: Option<u32>,
    pub max_frame_length: Option<usize>,
}

#[derive(Clone, Debug)]
pub(crate) struct ChatOptionsValidated {
    pub discovery_timeout: Duration,
    pub handshake_timeout: Duration,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub login_attempts: u32,
    pub max_frame_length: usize,
}

impl ChatOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.discovery_timeout == Duration::from_millis(0)
            || self.handshake_timeout == Duration::from_millis(0)
            || self.reconnect_delay == Duration::from_millis(0)
            || self.connect_timeout == Duration::from_millis(0)
        {
            return Err("Timeouts and delays must be non-zero");
        }
        if self.login_attempts == 0 {
            return Err("Clients must be allowed at least one login attempt");
        }
        if self.max_frame_length == 0 {
            return Err("Maximum frame length must be non-zero");
        }
        // A reconnecting client must not arrive before the promoted leader has finished waiting
        // for its backups.
        if self.discovery_timeout > self.reconnect_delay {
            return Err("Discovery timeout must not exceed the client's reconnect delay");
        }

        Ok(())
    }
}

impl TryFrom<ChatOptions> for ChatOptionsValidated {
    type Error = &'static str;

    fn try_from(options: ChatOptions) -> Result<Self, Self::Error> {
        let values = ChatOptionsValidated {
            discovery_timeout: options.discovery_timeout.unwrap_or(Duration::from_millis(100)),
            handshake_timeout: options.handshake_timeout.unwrap_or(Duration::from_millis(500)),
            reconnect_delay: options.reconnect_delay.unwrap_or(Duration::from_millis(500)),
            connect_timeout: options.connect_timeout.unwrap_or(Duration::from_secs(1)),
            login_attempts: options.login_attempts.unwrap_or(3),
            max_frame_length: options.max_frame_length.unwrap_or(1024 * 1024),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = ChatOptionsValidated::try_from(ChatOptions::default()).unwrap();
        assert_eq!(options.discovery_timeout, Duration::from_millis(100));
        assert_eq!(options.reconnect_delay, Duration::from_millis(500));
        assert_eq!(options.login_attempts, 3);
        assert_eq!(options.max_frame_length, 1024 * 1024);
    }

    #[test]
    fn zero_login_attempts_rejected() {
        let options = ChatOptions {
            login_attempts: Some(0),
            ..ChatOptions::default()
        };
        assert!(ChatOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn discovery_longer_than_reconnect_rejected() {
        let options = ChatOptions {
            discovery_timeout: Some(Duration::from_secs(2)),
            reconnect_delay: Some(Duration::from_secs(1)),
            ..ChatOptions::default()
        };
        assert!(ChatOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn zero_duration_rejected() {
        let options = ChatOptions {
            handshake_timeout: Some(Duration::from_millis(0)),
            ..ChatOptions::default()
        };
        assert!(ChatOptionsValidated::try_from(options).is_err());
    }
}
