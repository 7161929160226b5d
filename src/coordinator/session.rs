use crate::prelude::*;

/// Where a device's session stands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum SessionState {
    #[default]
    Unidentified,
    Identified,
    Authenticated,
    LoggedOut,
}

impl SessionState {
    pub fn identified(self) -> Self {
        match self {
            // identifying again mid-session does not drop the logon
            SessionState::Authenticated => self,
            _ => SessionState::Identified,
        }
    }

    pub fn authenticated(self) -> Result<Self> {
        match self {
            SessionState::Identified | SessionState::Authenticated => Ok(SessionState::Authenticated),
            other => Err(ProtocolError::BadArgument(format!("cannot log on from {:?}", other)).into()),
        }
    }

    pub fn logged_out(self) -> Self {
        match self {
            SessionState::Unidentified => self,
            _ => SessionState::LoggedOut,
        }
    }

    /// Transport reported nothing; identity has to be re-established.
    pub fn lost(self) -> Self {
        SessionState::Unidentified
    }

    pub fn is_authenticated(&self) -> bool {
        *self == SessionState::Authenticated
    }
}
