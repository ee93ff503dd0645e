//! Minimal scriptable SMTP server for delivery tests.
//!
//! Listens on an ephemeral loopback port, answers each command with a
//! configurable reply and records everything it receives, including the
//! message content transmitted after DATA.

#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::Mutex,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedCommand {
    Ehlo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    MessageContent(Vec<u8>),
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    fn new(code: u16, text: &str) -> Self {
        Self {
            code,
            text: text.to_string(),
        }
    }

    fn line(&self) -> String {
        format!("{} {}\r\n", self.code, self.text)
    }
}

#[derive(Debug, Clone)]
struct Script {
    greeting: Reply,
    ehlo: Reply,
    mail_from: Reply,
    rcpt_to: Reply,
    data: Reply,
    data_end: Reply,
    quit: Reply,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: Reply::new(220, "mock ESMTP ready"),
            ehlo: Reply::new(250, "mock greets you"),
            mail_from: Reply::new(250, "OK"),
            rcpt_to: Reply::new(250, "OK"),
            data: Reply::new(354, "end data with <CRLF>.<CRLF>"),
            data_end: Reply::new(250, "OK: queued"),
            quit: Reply::new(221, "bye"),
        }
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    commands: Arc<Mutex<Vec<ReceivedCommand>>>,
    shutdown: Arc<AtomicBool>,
}

pub struct MockSmtpServerBuilder {
    script: Script,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, text: &str) -> Self {
        self.script.mail_from = Reply::new(code, text);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, text: &str) -> Self {
        self.script.rcpt_to = Reply::new(code, text);
        self
    }

    #[must_use]
    pub fn with_data_response(mut self, code: u16, text: &str) -> Self {
        self.script.data = Reply::new(code, text);
        self
    }

    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let commands = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let script = self.script;
        let task_commands = Arc::clone(&commands);
        let task_shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            loop {
                if task_shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let Ok(Ok((stream, _peer))) = tokio::time::timeout(
                    std::time::Duration::from_millis(100),
                    listener.accept(),
                )
                .await
                else {
                    continue;
                };
                let script = script.clone();
                let commands = Arc::clone(&task_commands);
                tokio::spawn(async move {
                    let _ = handle_client(stream, script, commands).await;
                });
            }
        });

        Ok(MockSmtpServer {
            addr,
            commands,
            shutdown,
        })
    }
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            script: Script::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn commands(&self) -> Vec<ReceivedCommand> {
        self.commands.lock().await.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

async fn handle_client(
    mut stream: TcpStream,
    script: Script,
    commands: Arc<Mutex<Vec<ReceivedCommand>>>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    writer.write_all(script.greeting.line().as_bytes()).await?;
    writer.flush().await?;

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let upper = trimmed.to_ascii_uppercase();

        if upper.starts_with("EHLO") {
            let arg = trimmed.get(5..).unwrap_or("").to_string();
            commands.lock().await.push(ReceivedCommand::Ehlo(arg));
            writer.write_all(script.ehlo.line().as_bytes()).await?;
        } else if upper.starts_with("MAIL") {
            commands
                .lock()
                .await
                .push(ReceivedCommand::MailFrom(trimmed.to_string()));
            writer.write_all(script.mail_from.line().as_bytes()).await?;
        } else if upper.starts_with("RCPT") {
            commands
                .lock()
                .await
                .push(ReceivedCommand::RcptTo(trimmed.to_string()));
            writer.write_all(script.rcpt_to.line().as_bytes()).await?;
        } else if upper == "DATA" {
            commands.lock().await.push(ReceivedCommand::Data);
            writer.write_all(script.data.line().as_bytes()).await?;
            writer.flush().await?;
            if script.data.code == 354 {
                let mut content = Vec::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await? == 0 {
                        return Ok(());
                    }
                    if line.trim_end_matches(['\r', '\n']) == "." {
                        break;
                    }
                    // Undo dot-stuffing the way a real server would.
                    let text = line.strip_prefix('.').unwrap_or(&line);
                    content.extend_from_slice(text.as_bytes());
                }
                commands
                    .lock()
                    .await
                    .push(ReceivedCommand::MessageContent(content));
                writer.write_all(script.data_end.line().as_bytes()).await?;
            }
        } else if upper == "QUIT" {
            commands.lock().await.push(ReceivedCommand::Quit);
            writer.write_all(script.quit.line().as_bytes()).await?;
            writer.flush().await?;
            return Ok(());
        } else {
            commands
                .lock()
                .await
                .push(ReceivedCommand::Other(trimmed.to_string()));
            writer.write_all(b"500 unknown command\r\n").await?;
        }
        writer.flush().await?;
    }
}
