use std::fmt;
use std::str::FromStr;

/// Field separator inside a protocol line.
pub const SEP: &str = "*|*";

/// Separator between chunk names inside one field.
pub const NAME_SEP: &str = "--";

/// The three-letter command codes understood by both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Heartbeat probe, coordinator -> worker.
    Heartbeat,
    /// Heartbeat reply: worker is alive.
    Alive,
    /// Heartbeat reply: worker is not alive.
    NotAlive,
    /// Search request: `query`, `client id`.
    Search,
    /// Match found: `query`, `client id` (coordinator relays `worker id` to the client).
    Found,
    /// No match: `query`, `client id`.
    NotFound,
    /// Abort any in-flight search.
    Abort,
    /// Abort acknowledged.
    AbortAck,
    /// Load chunks into memory: `--`-joined names.
    Load,
    /// Drop chunks from memory: `--`-joined names.
    Unload,
    /// Resident chunk report: `--`-joined names.
    MemoryFiles,
    /// Graceful exit or disconnect notice.
    Exit,
    /// Join rejected, id already taken.
    Duplicate,
    /// Join accepted.
    Okay,
}

impl Command {
    pub const ALL: [Command; 14] = [
        Command::Heartbeat,
        Command::Alive,
        Command::NotAlive,
        Command::Search,
        Command::Found,
        Command::NotFound,
        Command::Abort,
        Command::AbortAck,
        Command::Load,
        Command::Unload,
        Command::MemoryFiles,
        Command::Exit,
        Command::Duplicate,
        Command::Okay,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Command::Heartbeat => "HBT",
            Command::Alive => "ALV",
            Command::NotAlive => "NAL",
            Command::Search => "SRH",
            Command::Found => "FND",
            Command::NotFound => "NFD",
            Command::Abort => "ABT",
            Command::AbortAck => "OBT",
            Command::Load => "LOD",
            Command::Unload => "ULD",
            Command::MemoryFiles => "MMF",
            Command::Exit => "EXT",
            Command::Duplicate => "DUP",
            Command::Okay => "OKY",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|command| command.code() == code)
            .ok_or_else(|| ProtocolError::UnknownCommand(code.to_string()))
    }
}

/// One protocol message: a command plus its positional fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub fields: Vec<String>,
}

impl Message {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            fields: Vec::new(),
        }
    }

    pub fn with_fields<I, S>(command: Command, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command,
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn search(query: &str, client_id: &str) -> Self {
        Self::with_fields(Command::Search, [query, client_id])
    }

    pub fn found(query: &str, client_id: &str) -> Self {
        Self::with_fields(Command::Found, [query, client_id])
    }

    pub fn not_found(query: &str, client_id: &str) -> Self {
        Self::with_fields(Command::NotFound, [query, client_id])
    }

    pub fn load<S: AsRef<str>>(names: &[S]) -> Self {
        Self::with_fields(Command::Load, [super::join_names(names)])
    }

    pub fn unload<S: AsRef<str>>(names: &[S]) -> Self {
        Self::with_fields(Command::Unload, [super::join_names(names)])
    }

    pub fn memory_files<S: AsRef<str>>(names: &[S]) -> Self {
        Self::with_fields(Command::MemoryFiles, [super::join_names(names)])
    }

    /// Returns the field at `index`, or a `MissingField` error naming the command.
    pub fn field(&self, index: usize) -> Result<&str, ProtocolError> {
        self.fields
            .get(index)
            .map(String::as_str)
            .ok_or(ProtocolError::MissingField {
                command: self.command,
                index,
            })
    }

    /// Chunk names carried in the first field of LOD/ULD/MMF. A missing field is an empty list.
    pub fn names(&self) -> Vec<String> {
        self.fields
            .first()
            .map(|field| super::split_names(field))
            .unwrap_or_default()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command.code())?;
        for field in &self.fields {
            f.write_str(SEP)?;
            f.write_str(field)?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message too short: {0:?}")]
    TooShort(String),

    #[error("unknown command code: {0:?}")]
    UnknownCommand(String),

    #[error("malformed message: {0:?}")]
    Malformed(String),

    #[error("{command} is missing field {index}")]
    MissingField { command: Command, index: usize },
}
