use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    process::{Child, ChildStdin, ChildStdout, Command},
    time::{sleep, timeout},
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn relay_binary_serves_raw_and_cli_clients() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("file_chat_relay");
    let storage = tempfile::tempdir()?;

    let (mut relay_child, mut relay_stdout) = spawn_relay(&binary, storage.path()).await?;
    let addr = read_relay_addr(&mut relay_stdout).await?;

    // Drain additional relay logs in the background so the pipe never fills.
    let relay_log_task = tokio::spawn(async move {
        drain_stdout(relay_stdout).await;
    });

    let mut alice = TcpStream::connect(&addr).await?;
    alice.write_all(b"alice").await?;
    // The relay has no acknowledgement, so give it a moment to take the name.
    sleep(Duration::from_millis(200)).await;

    let mut bob = spawn_client(&binary, "bob", &addr).await?;
    expect_text(&mut alice, "bob has joined the chat").await?;

    alice.write_all(b"hello bob").await?;
    let bob_hears_alice = read_line_expect(&mut bob.stdout, "waiting for bob to hear alice").await?;
    assert_eq!(bob_hears_alice, "alice: hello bob");

    bob.send_line("hi alice").await?;
    expect_text(&mut alice, "bob: hi alice").await?;

    let upload = storage.path().join("outgoing");
    tokio::fs::create_dir_all(&upload).await?;
    let notes = upload.join("notes.txt");
    tokio::fs::write(&notes, b"thirteen byte").await?;
    bob.send_line(&format!("/file {}", notes.display())).await?;
    let sent = read_line_expect(&mut bob.stdout, "waiting for file confirmation").await?;
    assert_eq!(sent, "*** sent file notes.txt (13 bytes)");
    expect_text(&mut alice, "FILE:notes.txt is available").await?;
    let stored = tokio::fs::read(storage.path().join("notes.txt")).await?;
    assert_eq!(stored, b"thirteen byte");

    bob.send_line("/quit").await?;
    let bob_quit = read_line_expect(&mut bob.stdout, "waiting for bob quit confirmation").await?;
    assert_eq!(bob_quit, "*** leaving chat");
    expect_text(&mut alice, "bob has left the chat").await?;
    ensure_success(&mut bob.child, "bob client").await?;

    let _ = relay_child.kill().await;
    let _ = relay_child.wait().await;
    let _ = relay_log_task.await;

    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

async fn spawn_relay(binary: &Path, storage: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("relay")
        .arg("0")
        .arg("--bind")
        .arg("127.0.0.1")
        .arg("--storage-dir")
        .arg(storage)
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn relay")?;
    let stdout = child
        .stdout
        .take()
        .context("relay stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_relay_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let line = read_line(reader)
        .await?
        .context("relay did not emit listening address")?;
    let trimmed = line.trim();
    let addr = trimmed
        .split_whitespace()
        .last()
        .context("unexpected relay banner format")?;
    if !addr.contains(':') {
        return Err(anyhow!("relay banner missing socket: {trimmed}"));
    }
    Ok(addr.to_string())
}

async fn spawn_client(binary: &Path, username: &str, addr: &str) -> Result<ClientProcess> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("address {addr} has no port"))?;

    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg(username)
        .arg(host)
        .arg(port)
        .env("RUST_LOG", "warn")
        .env("NO_COLOR", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn client {username}"))?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    let mut process = ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    };

    let banner = read_line_expect(&mut process.stdout, "waiting for connect banner").await?;
    if banner != format!("*** connected to {addr} as {username}") {
        return Err(anyhow!(
            "expected connect banner for {username}, got '{banner}'"
        ));
    }

    Ok(process)
}

async fn expect_text(stream: &mut TcpStream, expected: &str) -> Result<()> {
    let mut buf = vec![0; expected.len()];
    timeout(READ_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .with_context(|| format!("timed out waiting for '{expected}'"))??;
    assert_eq!(String::from_utf8_lossy(&buf), expected);
    Ok(())
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("{description}: stream closed")),
        Err(err) => Err(err.context(format!("{description}: failed to read line"))),
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let read_future = reader.read_line(&mut line);
    let bytes_io = match timeout(READ_TIMEOUT, read_future).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    let byte_count = bytes_io?;
    if byte_count == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| {
            let has_data = bytes > 0;
            if has_data {
                buffer.clear();
            }
            has_data
        })
        .unwrap_or(false)
    {}
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
