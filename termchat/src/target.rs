//! Join target: `user@host:session-id[:port]`.

use std::str::FromStr;

use crate::config::DEFAULT_PORT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub user: String,
    pub host: String,
    pub session_id: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("invalid format, expected user@host:session-id or user@host:session-id:port")]
    Format,
    #[error("invalid user@host format")]
    UserHost,
    #[error("user cannot be empty")]
    EmptyUser,
    #[error("host cannot be empty")]
    EmptyHost,
    #[error("session id cannot be empty")]
    EmptySession,
    #[error("invalid port number: {0}")]
    Port(String),
    #[error("port must be between 1 and 65535")]
    PortRange,
}

impl Target {
    /// Address to dial for this target.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_local(&self) -> bool {
        matches!(self.host.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

impl FromStr for Target {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(TargetError::Format);
        }
        let port = match parts.get(2) {
            Some(p) => {
                let n: u32 = p.parse().map_err(|_| TargetError::Port(p.to_string()))?;
                match u16::try_from(n) {
                    Ok(port) if port >= 1 => port,
                    _ => return Err(TargetError::PortRange),
                }
            }
            None => DEFAULT_PORT,
        };
        let (user, host) = parts[0].split_once('@').ok_or(TargetError::UserHost)?;
        if host.contains('@') {
            return Err(TargetError::UserHost);
        }
        if user.is_empty() {
            return Err(TargetError::EmptyUser);
        }
        if host.is_empty() {
            return Err(TargetError::EmptyHost);
        }
        if parts[1].is_empty() {
            return Err(TargetError::EmptySession);
        }
        Ok(Target {
            user: user.to_string(),
            host: host.to_string(),
            session_id: parts[1].to_string(),
            port,
        })
    }
}
