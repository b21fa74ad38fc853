use anyhow::anyhow;

pub type Result<T> = std::result::Result<T, LibError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Transport,
    Database,
    Forbidden,
    Unknown,
}

#[derive(Debug)]
pub struct LibError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub public: &'static str,
    pub source: anyhow::Error,
}

impl LibError {
    pub fn validation(public: &'static str, source: anyhow::Error) -> Self {
        Self::validation_with_code("invalid_input", public, source)
    }

    pub fn validation_with_code(
        code: &'static str,
        public: &'static str,
        source: anyhow::Error,
    ) -> Self {
        Self {
            kind: ErrorKind::Validation,
            code,
            public,
            source,
        }
    }

    pub fn conflict_name(source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Conflict,
            code: "tag_name_conflict",
            public: "A tag with this name already exists on this board",
            source,
        }
    }

    pub fn conflict_color(source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Conflict,
            code: "tag_color_conflict",
            public: "A tag with this color already exists on this board",
            source,
        }
    }

    pub fn not_found(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            code: "not_found",
            public,
            source,
        }
    }

    pub fn transport(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Transport,
            code: "transport_error",
            public,
            source,
        }
    }

    pub fn database(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Database,
            code: "database_error",
            public,
            source,
        }
    }

    pub fn forbidden(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Forbidden,
            code: "forbidden",
            public,
            source,
        }
    }

    pub fn unknown(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            code: "unknown_error",
            public,
            source,
        }
    }

    pub fn message(public: &'static str) -> Self {
        Self::unknown(public, anyhow!(public))
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == ErrorKind::Conflict
    }
}

impl std::fmt::Display for LibError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {:#}", self.public, self.code, self.source)
    }
}

impl std::error::Error for LibError {}

#[cfg(feature = "sqlx")]
pub(crate) const TAG_NAME_CONSTRAINT: &str = "tags_board_id_name_key";
#[cfg(feature = "sqlx")]
pub(crate) const TAG_COLOR_CONSTRAINT: &str = "tags_board_id_color_key";

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for LibError {
    fn from(value: sqlx::Error) -> Self {
        let constraint = value
            .as_database_error()
            .and_then(|db_err| db_err.constraint())
            .map(str::to_owned);
        match constraint.as_deref() {
            Some(TAG_NAME_CONSTRAINT) => Self::conflict_name(anyhow!(value)),
            Some(TAG_COLOR_CONSTRAINT) => Self::conflict_color(anyhow!(value)),
            _ => Self::database("Database request failed", anyhow!(value)),
        }
    }
}
