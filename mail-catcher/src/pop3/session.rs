use super::commands::{parse_message_number, CommandLine, Pop3Command};
use super::snapshot::Snapshot;
use crate::config::Pop3Config;
use crate::message::MessageManager;
use crate::metrics::Metrics;
use crate::net::LineStream;
use crate::storage::Message;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pop3State {
    /// The client must identify itself
    Authorization,
    /// Mailbox open
    Transaction,
    Quit,
}

impl fmt::Display for Pop3State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Pop3State::Authorization => "AUTHORIZATION",
            Pop3State::Transaction => "TRANSACTION",
            Pop3State::Quit => "QUIT",
        };
        f.write_str(name)
    }
}

/// Everything a session shares with its server
pub struct SessionContext {
    pub config: Pop3Config,
    pub manager: Arc<MessageManager>,
    /// Present when STLS is offered
    pub tls: Option<TlsAcceptor>,
    pub metrics: Arc<Metrics>,
}

/// One POP3 conversation.
///
/// Any password is accepted. The mailbox is read once at login and never
/// again; DELE only marks messages, which are removed from storage when the
/// client QUITs from the TRANSACTION state.
pub struct Pop3Session<S> {
    ctx: Arc<SessionContext>,
    stream: LineStream<S>,
    state: Pop3State,
    user: Option<String>,
    mailbox: String,
    snapshot: Snapshot,
}

impl<S> Pop3Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(ctx: Arc<SessionContext>, stream: S) -> Self {
        let idle = ctx.config.timeout();
        Self {
            ctx,
            stream: LineStream::new(stream, idle),
            state: Pop3State::Authorization,
            user: None,
            mailbox: String::new(),
            snapshot: Snapshot::default(),
        }
    }

    pub async fn run(mut self) {
        info!("Starting POP3 session");
        if let Err(e) = self.serve().await {
            warn!("Network send error: {}", e);
        }
        if let Err(e) = self.stream.shutdown().await {
            debug!("Error closing connection: {}", e);
        }
        info!("Closing connection");
    }

    async fn serve(&mut self) -> io::Result<()> {
        let greeting = format!(
            "+OK Mail catcher POP3 server ready <{}.{}@{}>",
            std::process::id(),
            chrono::Utc::now().timestamp(),
            self.ctx.config.domain
        );
        self.send(&greeting).await?;

        while self.state != Pop3State::Quit {
            let line = match self.stream.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    match self.state {
                        Pop3State::Authorization => {
                            info!(state = %self.state, "Client closed connection")
                        }
                        _ => warn!(state = %self.state, "Got EOF"),
                    }
                    break;
                }
                Err(e) => {
                    warn!("Connection error: {}", e);
                    if e.kind() == io::ErrorKind::TimedOut {
                        self.send("-ERR Idle timeout, bye bye").await?;
                    } else {
                        self.send("-ERR Connection error, sorry").await?;
                    }
                    break;
                }
            };
            self.handle_line(&line).await?;
        }

        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> io::Result<()> {
        let (command, args) = match CommandLine::parse(line) {
            CommandLine::Empty => return self.send("-ERR Speak up").await,
            CommandLine::Unrecognized(verb) => {
                warn!("Unrecognized command: {}", verb);
                return self
                    .send(&format!("-ERR Syntax error, {} command unrecognized", verb))
                    .await;
            }
            CommandLine::Command(command, args) => (command, args),
        };
        // Never log the password
        if command == Pop3Command::Pass {
            debug!(">> PASS ****");
        } else {
            debug!(">> {}", line);
        }

        if command == Pop3Command::Capa {
            return self.capabilities().await;
        }

        match self.state {
            Pop3State::Authorization => self.authorization_handler(command, &args).await,
            Pop3State::Transaction => self.transaction_handler(command, &args).await,
            Pop3State::Quit => Ok(()),
        }
    }

    async fn capabilities(&mut self) -> io::Result<()> {
        let mut lines = vec!["+OK Capability list follows", "TOP", "USER", "UIDL"];
        lines.push("IMPLEMENTATION Mail catcher");
        if self.ctx.tls.is_some() && !self.stream.is_tls() {
            lines.push("STLS");
        }
        lines.push(".");
        self.send_lines(lines.into_iter().map(str::to_string)).await
    }

    async fn authorization_handler(
        &mut self,
        command: Pop3Command,
        args: &[String],
    ) -> io::Result<()> {
        match command {
            Pop3Command::Quit => {
                self.send("+OK Goodnight and good luck").await?;
                self.enter_state(Pop3State::Quit);
                Ok(())
            }
            Pop3Command::User => match args.first() {
                Some(user) => {
                    self.user = Some(user.clone());
                    self.send(&format!("+OK Hello {}, welcome", user)).await
                }
                None => self.send("-ERR Missing username argument").await,
            },
            Pop3Command::Pass => match self.user.clone() {
                Some(user) => self.open_mailbox(&user).await,
                None => self.out_of_sequence(command).await,
            },
            Pop3Command::Apop => {
                if args.len() != 2 {
                    warn!("Expected two arguments for APOP");
                    return self.send("-ERR APOP requires two arguments").await;
                }
                self.user = Some(args[0].clone());
                self.open_mailbox(&args[0]).await
            }
            Pop3Command::Stls => self.start_tls().await,
            _ => self.out_of_sequence(command).await,
        }
    }

    async fn start_tls(&mut self) -> io::Result<()> {
        let Some(acceptor) = self.ctx.tls.clone() else {
            return self.send("-ERR TLS not available").await;
        };
        if self.stream.is_tls() {
            warn!("Client requested STLS twice");
            return self.send("-ERR A TLS session already agreed upon").await;
        }

        self.send("+OK Begin TLS negotiation").await?;
        self.stream.upgrade(&acceptor).await?;
        info!("Connection upgraded to TLS");
        Ok(())
    }

    /// Loads the snapshot and enters TRANSACTION. The user name is mapped to
    /// a mailbox the same way recipient addresses are.
    async fn open_mailbox(&mut self, user: &str) -> io::Result<()> {
        let loaded = self
            .ctx
            .manager
            .mailbox_for_address(user)
            .and_then(|mailbox| {
                let messages = self.ctx.manager.store().get_messages(&mailbox)?;
                Ok((mailbox, messages))
            });

        match loaded {
            Ok((mailbox, messages)) => {
                self.mailbox = mailbox;
                self.snapshot = Snapshot::new(messages);
                info!(mailbox = %self.mailbox, count = self.snapshot.len(), "Mailbox opened");
                self.send(&format!(
                    "+OK Found {} messages for {}",
                    self.snapshot.count(),
                    user
                ))
                .await?;
                self.enter_state(Pop3State::Transaction);
                Ok(())
            }
            Err(e) => {
                error!("Failed to open mailbox for {}: {}", user, e);
                self.send(&format!("-ERR Failed to open mailbox for {}", user))
                    .await?;
                self.enter_state(Pop3State::Quit);
                Ok(())
            }
        }
    }

    async fn transaction_handler(
        &mut self,
        command: Pop3Command,
        args: &[String],
    ) -> io::Result<()> {
        match command {
            Pop3Command::Stat => {
                if !args.is_empty() {
                    warn!("STAT got an unexpected argument");
                    return self.send("-ERR STAT command must have no arguments").await;
                }
                let reply = format!("+OK {} {}", self.snapshot.count(), self.snapshot.size());
                self.send(&reply).await
            }
            Pop3Command::List => self.listing(command, args, |m| m.size().to_string()).await,
            Pop3Command::Uidl => self.listing(command, args, |m| m.id().to_string()).await,
            Pop3Command::Dele => {
                let number = match self.single_message_arg(command, args) {
                    Ok(number) => number,
                    Err(reply) => return self.send(&reply).await,
                };
                if self.snapshot.delete(number) {
                    self.send(&format!("+OK Deleted message {}", number)).await
                } else {
                    warn!("Client tried to DELE an already deleted message");
                    self.send(&format!("-ERR Message {} has already been deleted", number))
                        .await
                }
            }
            Pop3Command::Retr => {
                let number = match self.single_message_arg(command, args) {
                    Ok(number) => number,
                    Err(reply) => return self.send(&reply).await,
                };
                self.send_message(number, None).await
            }
            Pop3Command::Top => {
                if args.len() != 2 {
                    warn!("TOP command had invalid number of arguments");
                    return self.send("-ERR TOP command requires two arguments").await;
                }
                let number = match parse_message_number(&args[0], self.snapshot.len(), "TOP first")
                {
                    Ok(number) => number,
                    Err(reply) => return self.send(&reply).await,
                };
                let lines: usize = match args[1].parse::<i32>() {
                    Ok(lines) if lines < 0 => {
                        return self.send("-ERR TOP second argument must be non-negative").await
                    }
                    Ok(lines) => lines as usize,
                    Err(_) => return self.send("-ERR TOP command requires an integer argument").await,
                };
                self.send_message(number, Some(lines)).await
            }
            Pop3Command::Quit => {
                self.commit();
                self.send("+OK We will process your deletes").await?;
                self.enter_state(Pop3State::Quit);
                Ok(())
            }
            Pop3Command::Noop => self.send("+OK I have sucessfully done nothing").await,
            Pop3Command::Rset => {
                debug!("Resetting session state on RSET request");
                self.snapshot.reset();
                self.send("+OK Session reset").await
            }
            _ => self.out_of_sequence(command).await,
        }
    }

    /// LIST and UIDL: one message with an argument, all retained ones without
    async fn listing<F>(&mut self, command: Pop3Command, args: &[String], describe: F) -> io::Result<()>
    where
        F: Fn(&Message) -> String,
    {
        if args.len() > 1 {
            warn!("{} command had more than 1 argument", command);
            return self
                .send(&format!("-ERR {} command must have zero or one argument", command))
                .await;
        }

        if let Some(arg) = args.first() {
            let number = match parse_message_number(arg, self.snapshot.len(), command.as_str()) {
                Ok(number) => number,
                Err(reply) => return self.send(&reply).await,
            };
            let reply = match self.snapshot.get(number) {
                Some(_) if self.snapshot.is_deleted(number) => {
                    format!("-ERR You deleted message {}", number)
                }
                Some(message) => format!("+OK {} {}", number, describe(message)),
                None => format!("-ERR No message {}", number),
            };
            return self.send(&reply).await;
        }

        let mut lines = vec![format!("+OK Listing {} messages", self.snapshot.count())];
        lines.extend(
            self.snapshot
                .retained()
                .map(|(number, message)| format!("{} {}", number, describe(message))),
        );
        lines.push(".".to_string());
        self.send_lines(lines.into_iter()).await
    }

    fn single_message_arg(&self, command: Pop3Command, args: &[String]) -> Result<usize, String> {
        if args.len() != 1 {
            warn!("{} command had invalid number of arguments", command);
            return Err(format!("-ERR {} command requires a single argument", command));
        }
        parse_message_number(&args[0], self.snapshot.len(), command.as_str())
    }

    /// RETR, or TOP when `body_lines` is set. Lines starting with `.` are
    /// stuffed.
    async fn send_message(&mut self, number: usize, body_lines: Option<usize>) -> io::Result<()> {
        if self.snapshot.is_deleted(number) {
            return self
                .send(&format!("-ERR You deleted message {}", number))
                .await;
        }
        let Some(message) = self.snapshot.get(number) else {
            return self.send(&format!("-ERR No message {}", number)).await;
        };
        let size = message.size();
        let source = match message.source() {
            Ok(source) => source,
            Err(e) => {
                error!(id = %message.id(), "Failed to read message: {}", e);
                return self
                    .send("-ERR Failed to RETR that message, internal error")
                    .await;
            }
        };

        let status = match body_lines {
            None => format!("+OK {} bytes follows", size),
            Some(_) => "+OK Top of message follows".to_string(),
        };
        let mut out = Vec::with_capacity(source.len() + status.len() + 16);
        out.extend_from_slice(status.as_bytes());
        out.extend_from_slice(b"\r\n");
        write_stuffed(&mut out, &source, body_lines);
        out.extend_from_slice(b".\r\n");

        self.stream.write_all(&out).await?;
        if body_lines.is_none() {
            self.ctx.metrics.inc_retrieved();
        }
        Ok(())
    }

    /// Removes every message marked for deletion. A failure is logged and
    /// does not stop the others.
    fn commit(&self) {
        info!(mailbox = %self.mailbox, count = self.snapshot.pending_deletes().count(), "Processing deletes");
        let mut deleted = 0;
        for message in self.snapshot.pending_deletes() {
            debug!(id = %message.id(), "Deleting message");
            match self.ctx.manager.remove_message(&self.mailbox, message.id()) {
                Ok(()) => deleted += 1,
                Err(e) => warn!(id = %message.id(), "Error deleting message: {}", e),
            }
        }
        self.ctx.metrics.add_pop3_deleted(deleted);
    }

    async fn out_of_sequence(&mut self, command: Pop3Command) -> io::Result<()> {
        warn!(state = %self.state, "Wasn't expecting {} here", command);
        self.send(&format!("-ERR Command {} is out of sequence", command))
            .await
    }

    async fn send(&mut self, line: &str) -> io::Result<()> {
        self.stream.send(line).await
    }

    async fn send_lines<I>(&mut self, lines: I) -> io::Result<()>
    where
        I: Iterator<Item = String>,
    {
        let mut out = Vec::new();
        for line in lines {
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        self.stream.write_all(&out).await
    }

    fn enter_state(&mut self, state: Pop3State) {
        self.state = state;
        debug!("Entering state {}", state);
    }
}

/// Appends `source` line by line with CRLF endings and dot-stuffing. With
/// `body_lines`, stops after the headers plus that many body lines.
fn write_stuffed(out: &mut Vec<u8>, source: &[u8], body_lines: Option<usize>) {
    let mut lines: Vec<&[u8]> = source.split(|&b| b == b'\n').collect();
    // A trailing newline does not start another line
    if lines.last().map_or(false, |l| l.is_empty()) {
        lines.pop();
    }

    let mut in_body = false;
    let mut remaining = body_lines.unwrap_or(usize::MAX);
    for line in lines {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if in_body {
            if remaining == 0 {
                break;
            }
            remaining -= 1;
        } else if line.is_empty() {
            in_body = true;
        }
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
}
