use std::{path::Path, process::Stdio};

use tokio::{
  io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
    BufReader, BufWriter,
  },
  process::{Child, ChildStdin, ChildStdout, Command},
};

use crate::error::{Error, Result};

/// The line-framed filter protocol, generic over the transport so tests
/// can drive it through an in-memory duplex.
///
/// A value frame is `<length>\n` + bytes + `\n`; a lone blank line is the
/// `none` sentinel; an array is value frames terminated by `none`;
/// booleans are the literals `true`/`false`. Tags are bare lines.
pub struct Conn<R, W> {
  rx: BufReader<R>,
  tx: BufWriter<W>,
}

impl<R, W> Conn<R, W>
where
  R: AsyncRead + Unpin + Send,
  W: AsyncWrite + Unpin + Send,
{
  pub fn new(rx: R, tx: W) -> Self {
    Self {
      rx: BufReader::new(rx),
      tx: BufWriter::new(tx),
    }
  }

  /// Read a tag. End of stream reads as an empty tag, which the command
  /// loop treats as an unknown command.
  pub async fn tag(&mut self) -> Result<String> {
    let mut line = String::new();
    self.rx.read_line(&mut line).await?;
    Ok(line.trim().to_string())
  }

  /// Read a value frame; `None` for the blank-line sentinel.
  pub async fn item(&mut self) -> Result<Option<Vec<u8>>> {
    let mut line = String::new();
    let n = self.rx.read_line(&mut line).await?;
    if n == 0 {
      return Err(
        std::io::Error::new(
          std::io::ErrorKind::UnexpectedEof,
          "end of input stream",
        )
        .into(),
      );
    }
    let line = line.trim();
    if line.is_empty() {
      return Ok(None);
    }
    let size: usize = line
      .parse()
      .map_err(|_| Error::Execution(format!("bad length frame: {line}")))?;
    let mut value = vec![0u8; size];
    self.rx.read_exact(&mut value).await?;
    // Swallow the trailing newline.
    let mut newline = [0u8; 1];
    self.rx.read_exact(&mut newline).await?;
    Ok(Some(value))
  }

  /// Read value frames up to the terminating `none`.
  pub async fn array(&mut self) -> Result<Vec<Vec<u8>>> {
    let mut items = Vec::new();
    while let Some(item) = self.item().await? {
      items.push(item);
    }
    Ok(items)
  }

  pub async fn send_value(&mut self, value: &[u8]) -> Result<()> {
    self
      .tx
      .write_all(format!("{}\n", value.len()).as_bytes())
      .await?;
    self.tx.write_all(value).await?;
    self.tx.write_all(b"\n").await?;
    Ok(())
  }

  pub async fn send_bool(&mut self, value: bool) -> Result<()> {
    self
      .send_value(if value { b"true" } else { b"false" })
      .await
  }

  pub async fn send_none(&mut self) -> Result<()> {
    self.tx.write_all(b"\n").await?;
    Ok(())
  }

  pub async fn send_list<I>(&mut self, values: I) -> Result<()>
  where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
  {
    for value in values {
      self.send_value(value.as_ref()).await?;
    }
    self.tx.write_all(b"\n").await?;
    Ok(())
  }

  pub async fn flush(&mut self) -> Result<()> {
    self.tx.flush().await?;
    Ok(())
  }
}

/// A running filter child process with the protocol pipes attached.
pub struct FilterProcess {
  // Held for its kill-on-drop guarantee.
  _child: Child,
  conn: Conn<ChildStdout, ChildStdin>,
}

impl FilterProcess {
  /// Spawn the filter binary and perform the initial handshake: protocol
  /// version, filter name, argument array, blob. An unset blob still goes
  /// out as an empty value frame.
  pub async fn spawn(
    path: &Path,
    name: &str,
    arguments: &[String],
    blob: &[u8],
  ) -> Result<Self> {
    let mut command = Command::new(path);
    command
      .arg("--filter")
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .kill_on_drop(true);
    if let Ok(tmpdir) = std::env::var("TMPDIR") {
      command.current_dir(tmpdir);
    }

    let launch_error =
      || Error::Execution(format!("unable to launch filter {name}"));
    let mut child = command.spawn().map_err(|_| launch_error())?;
    let stdout = child.stdout.take().ok_or_else(launch_error)?;
    let stdin = child.stdin.take().ok_or_else(launch_error)?;

    let mut conn = Conn::new(stdout, stdin);
    let handshake = async {
      conn.send_value(b"1").await?;
      conn.send_value(name.as_bytes()).await?;
      conn.send_list(arguments.iter().map(String::as_bytes)).await?;
      conn.send_value(blob).await?;
      conn.flush().await
    };
    if handshake.await.is_err() {
      return Err(launch_error());
    }

    Ok(Self {
      _child: child,
      conn,
    })
  }

  pub fn conn(&mut self) -> &mut Conn<ChildStdout, ChildStdin> {
    &mut self.conn
  }
}
