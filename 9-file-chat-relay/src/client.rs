use std::path::Path;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    config::DEFAULT_READ_BUFFER_SIZE,
    framer::{Message, write_message},
};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    send_username(&mut writer, &args.username).await?;
    write_stdout(&format!(
        "*** connected to {}:{} as {}",
        args.host, args.port, args.username
    ))
    .await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
    let stream = TcpStream::connect((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;

    info!("connected to {}:{}", args.host, args.port);
    Ok(stream.into_split())
}

async fn send_username(writer: &mut OwnedWriteHalf, username: &str) -> Result<()> {
    let username = username.trim();
    anyhow::ensure!(!username.is_empty(), "username cannot be empty");

    write_message(writer, &Message::text(username))
        .await
        .context("failed to send username")
}

async fn run_client_loop(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    let mut buffer = vec![0u8; DEFAULT_READ_BUFFER_SIZE];
    loop {
        input.clear();
        select! {
            bytes_read = reader.read(&mut buffer) => {
                if !handle_server_bytes(bytes_read, &buffer).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

/// Prints one read from the relay as one line.
async fn handle_server_bytes(bytes_read: io::Result<usize>, buffer: &[u8]) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        write_stdout("*** server closed the connection").await?;
        return Ok(false);
    }

    let text = String::from_utf8_lossy(&buffer[..bytes_read]);
    write_stdout(text.trim_end_matches(LINE_ENDINGS)).await?;
    Ok(true)
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end_matches(LINE_ENDINGS);
    if text.trim().is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    if let Some(path) = text.strip_prefix("/file ") {
        // A missing or unreadable file is reported and the session goes on.
        if let Err(err) = send_file(writer, Path::new(path.trim())).await {
            write_stderr(&format!("!!! {err:#}")).await?;
        }
        return Ok(true);
    }

    write_message(writer, &Message::text(text)).await?;
    Ok(true)
}

async fn send_file(writer: &mut OwnedWriteHalf, path: &Path) -> Result<()> {
    let name = path
        .file_name()
        .with_context(|| format!("{} is not a file path", path.display()))?
        .to_string_lossy()
        .into_owned();
    let payload = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let size = payload.len();

    let offer = Message::file_offer(&name, payload);
    write_message(writer, &offer)
        .await
        .context("failed to send file")?;

    write_stdout(&format!("*** sent file {name} ({size} bytes)")).await?;
    Ok(())
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
