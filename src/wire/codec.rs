use super::types::{Command, Message, NAME_SEP, ProtocolError, SEP};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

const CODE_LEN: usize = 3;

/// Renders a message as one newline-terminated protocol line.
pub fn encode(message: &Message) -> String {
    let mut line = message.to_string();
    line.push('\n');
    line
}

/// Parses one protocol line (with or without its trailing newline).
///
/// The first three characters select the command. Anything after them must be
/// a sequence of `*|*`-introduced fields.
pub fn decode(line: &str) -> Result<Message, ProtocolError> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);

    if line.len() < CODE_LEN {
        return Err(ProtocolError::TooShort(line.to_string()));
    }
    let (code, rest) = match line.get(..CODE_LEN) {
        Some(code) => (code, &line[CODE_LEN..]),
        None => return Err(ProtocolError::Malformed(line.to_string())),
    };
    let command: Command = code.parse()?;

    if rest.is_empty() {
        return Ok(Message::new(command));
    }

    let Some(body) = rest.strip_prefix(SEP) else {
        return Err(ProtocolError::Malformed(line.to_string()));
    };

    Ok(Message {
        command,
        fields: body.split(SEP).map(str::to_string).collect(),
    })
}

/// Joins chunk names into a single `--`-separated field.
pub fn join_names<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(NAME_SEP)
}

/// Splits a `--`-separated field into chunk names, skipping empty entries.
pub fn split_names(field: &str) -> Vec<String> {
    field
        .split(NAME_SEP)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Writes queued messages to `writer` until every sender is dropped, then
/// shuts the writer down so the peer sees EOF.
pub async fn write_messages<W>(
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Message>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = queue.recv().await {
        writer.write_all(encode(&message).as_bytes()).await?;
    }
    writer.shutdown().await
}
