use serde::Serialize;

use crate::mutation::MutationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Success,
    Error,
}

/// A message for the person who triggered a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub level: Level,
    pub title: String,
    pub message: String,
    pub dismissable: bool,
}

impl Notification {
    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: Level::Success,
            title: title.into(),
            message: message.into(),
            dismissable: false,
        }
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: Level::Error,
            title: title.into(),
            message: message.into(),
            dismissable: true,
        }
    }

    pub fn is_error(&self) -> bool {
        self.level == Level::Error
    }

    /// Turn a mutation result into what the user gets to see.
    pub fn from_result<T>(
        result: &Result<T, MutationError>,
        on_success: impl FnOnce(&T) -> (String, String),
    ) -> Self {
        match result {
            Ok(value) => {
                let (title, message) = on_success(value);
                Self::success(title, message)
            }
            Err(e) => Self::from(e),
        }
    }
}

impl From<&MutationError> for Notification {
    fn from(error: &MutationError) -> Self {
        match error {
            MutationError::Validation(fields) => {
                Self::error("Missing required fields", fields.join(", "))
            }
            MutationError::MissingOrganization => Self::error(
                "No organization selected",
                "Select an organization before making changes.",
            ),
            MutationError::Backend(e) => Self::error("Request failed", e.to_string()),
            MutationError::InvalidResponse => Self::error(
                "Unexpected response",
                "The change was sent but the server's answer could not be read. The page will reload.",
            ),
        }
    }
}

impl std::fmt::Display for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.level {
            Level::Success => "ok",
            Level::Error => "error",
        };
        write!(f, "[{level}] {}: {}", self.title, self.message)
    }
}
