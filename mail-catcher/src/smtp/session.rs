use super::commands::{parse_hello_argument, parse_mail_from, parse_rcpt_to, CommandLine, SmtpCommand};
use crate::config::SmtpConfig;
use crate::extension::{ExtensionHost, SmtpResponse, SmtpSessionInfo};
use crate::message::{Address, MessageManager};
use crate::metrics::Metrics;
use crate::net::LineStream;
use crate::policy::{Origin, Recipient};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Longest DATA line read in one piece; longer lines are read in chunks
const MAX_DATA_LINE: u64 = 64 * 1024;

const READY_BANNER: &str = "Great, let's get this show on the road";

/// Base64 of "User Name\0"
const USERNAME_CHALLENGE: &str = "VXNlciBOYW1lAA==";

/// Base64 of "Password\0"
const PASSWORD_CHALLENGE: &str = "UGFzc3dvcmQA";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    /// Waiting for HELO/EHLO
    Greet,
    /// Waiting for MAIL
    Ready,
    /// AUTH LOGIN: waiting for the user name
    Login,
    /// AUTH LOGIN: waiting for the password
    Password,
    /// Waiting for RCPT or DATA
    Mail,
    /// Reading the message content
    Data,
    Quit,
}

impl fmt::Display for SmtpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SmtpState::Greet => "GREET",
            SmtpState::Ready => "READY",
            SmtpState::Login => "LOGIN",
            SmtpState::Password => "PASSWORD",
            SmtpState::Mail => "MAIL",
            SmtpState::Data => "DATA",
            SmtpState::Quit => "QUIT",
        };
        f.write_str(name)
    }
}

/// Everything a session shares with its server
pub struct SessionContext {
    pub config: SmtpConfig,
    pub manager: Arc<MessageManager>,
    pub extensions: Arc<ExtensionHost>,
    /// Present when STARTTLS is offered
    pub tls: Option<TlsAcceptor>,
    pub metrics: Arc<Metrics>,
}

/// One SMTP conversation.
///
/// Protocol errors are answered and the session carries on; only I/O
/// failures and the idle deadline end it early.
pub struct SmtpSession<S> {
    ctx: Arc<SessionContext>,
    stream: LineStream<S>,
    state: SmtpState,
    peer: SocketAddr,
    remote_domain: String,
    from: Option<Origin>,
    recipients: Vec<Recipient>,
}

impl<S> SmtpSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(ctx: Arc<SessionContext>, stream: S, peer: SocketAddr) -> Self {
        let idle = ctx.config.timeout();
        Self {
            ctx,
            stream: LineStream::new(stream, idle),
            state: SmtpState::Greet,
            peer,
            remote_domain: String::new(),
            from: None,
            recipients: Vec::new(),
        }
    }

    /// Runs the session until QUIT, end of stream or a transport error.
    pub async fn run(mut self) {
        info!("Starting SMTP session");
        if let Err(e) = self.serve().await {
            self.ctx.metrics.inc_smtp_errors();
            warn!("Network send error: {}", e);
        }
        if let Err(e) = self.stream.shutdown().await {
            debug!("Error closing connection: {}", e);
        }
        info!("Closing connection");
    }

    async fn serve(&mut self) -> io::Result<()> {
        self.greet().await?;

        while self.state != SmtpState::Quit {
            if self.state == SmtpState::Data {
                self.data_handler().await?;
                continue;
            }

            let line = match self.stream.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    match self.state {
                        SmtpState::Greet | SmtpState::Ready => {
                            info!(state = %self.state, "Client closed connection")
                        }
                        _ => warn!(state = %self.state, "Got EOF"),
                    }
                    break;
                }
                Err(e) => {
                    warn!("Connection error: {}", e);
                    self.ctx.metrics.inc_smtp_errors();
                    if e.kind() == io::ErrorKind::TimedOut {
                        self.send("221 Idle timeout, bye bye").await?;
                    } else {
                        self.send("221 Connection error, sorry").await?;
                    }
                    break;
                }
            };
            debug!(">> {}", line);

            // The AUTH LOGIN replies are not commands
            match self.state {
                SmtpState::Login => {
                    self.send(&format!("334 {}", PASSWORD_CHALLENGE)).await?;
                    self.enter_state(SmtpState::Password);
                    continue;
                }
                SmtpState::Password => {
                    self.send("235 Authentication successful").await?;
                    self.enter_state(SmtpState::Ready);
                    continue;
                }
                _ => {}
            }

            self.handle_line(&line).await?;
        }

        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> io::Result<()> {
        let (command, arg) = match CommandLine::parse(line) {
            CommandLine::Empty => return self.send("500 Speak up").await,
            CommandLine::Garbled => {
                warn!("Command too short: {:?}", line);
                return self.send("500 Syntax error, command garbled").await;
            }
            CommandLine::Unrecognized(verb) => {
                warn!("Unrecognized command: {}", verb);
                return self
                    .send(&format!("500 Syntax error, {} command unrecognized", verb))
                    .await;
            }
            CommandLine::Command(command, arg) => (command, arg),
        };

        // Commands handled the same way in every state
        if command.is_unimplemented() {
            warn!("Command {} not implemented", command);
            return self
                .send(&format!("502 {} command not implemented", command))
                .await;
        }
        match command {
            SmtpCommand::Vrfy => {
                return self
                    .send("252 Cannot VRFY user, but will accept message")
                    .await
            }
            SmtpCommand::Noop => return self.send("250 I have successfully done nothing").await,
            SmtpCommand::Rset => {
                debug!("Resetting session state on RSET request");
                self.reset();
                return self.send("250 Session reset").await;
            }
            SmtpCommand::Quit => {
                self.send("221 Goodnight and good luck").await?;
                self.enter_state(SmtpState::Quit);
                return Ok(());
            }
            _ => {}
        }

        match self.state {
            SmtpState::Greet => self.greet_handler(command, &arg).await,
            SmtpState::Ready => self.ready_handler(command, &arg).await,
            SmtpState::Mail => self.mail_handler(command, &arg).await,
            state => {
                warn!(state = %state, "Command {} in unexpected state", command);
                self.out_of_sequence(command).await
            }
        }
    }

    async fn greet_handler(&mut self, command: SmtpCommand, arg: &str) -> io::Result<()> {
        match command {
            SmtpCommand::Helo | SmtpCommand::Ehlo => {
                let Some(domain) = parse_hello_argument(arg) else {
                    return self
                        .send(&format!(
                            "501 Domain/address argument required for {}",
                            command
                        ))
                        .await;
                };
                self.remote_domain = domain.to_string();

                if command == SmtpCommand::Helo {
                    self.send(&format!("250 {}", READY_BANNER)).await?;
                } else {
                    // Extensions before SIZE
                    self.send(&format!("250-{}", READY_BANNER)).await?;
                    self.send("250-8BITMIME").await?;
                    self.send("250-AUTH PLAIN LOGIN").await?;
                    if self.ctx.tls.is_some() && !self.stream.is_tls() {
                        self.send("250-STARTTLS").await?;
                    }
                    self.send(&format!("250 SIZE {}", self.ctx.config.max_message_bytes))
                        .await?;
                }
                self.enter_state(SmtpState::Ready);
                Ok(())
            }
            _ => self.out_of_sequence(command).await,
        }
    }

    async fn ready_handler(&mut self, command: SmtpCommand, arg: &str) -> io::Result<()> {
        match command {
            SmtpCommand::StartTls => self.start_tls().await,
            SmtpCommand::Auth => self.auth(arg).await,
            SmtpCommand::Mail => self.mail_from(arg).await,
            SmtpCommand::Ehlo => {
                debug!("Resetting session state on EHLO request");
                self.reset();
                self.send("250 Session reset").await
            }
            _ => self.out_of_sequence(command).await,
        }
    }

    async fn start_tls(&mut self) -> io::Result<()> {
        let Some(acceptor) = self.ctx.tls.clone() else {
            return self.send("454 TLS unavailable on the server").await;
        };
        if self.stream.is_tls() {
            return self.send("454 A TLS session already agreed upon.").await;
        }

        debug!("Initiating TLS handshake");
        self.send("220 STARTTLS").await?;
        self.stream.upgrade(&acceptor).await?;
        info!("Connection upgraded to TLS");

        // The client must introduce itself again
        self.from = None;
        self.recipients.clear();
        self.enter_state(SmtpState::Greet);
        Ok(())
    }

    async fn auth(&mut self, arg: &str) -> io::Result<()> {
        let args: Vec<&str> = arg.splitn(3, ' ').collect();
        match args[0] {
            "PLAIN" => {
                if args.len() != 2 {
                    warn!("Bad auth attempt: {:?}", arg);
                    return self.send("500 Bad auth arguments").await;
                }
                info!(user = %plain_auth_user(args[1]), "Accepting credentials");
                self.send("235 2.7.0 Authentication successful").await
            }
            "LOGIN" => {
                self.send(&format!("334 {}", USERNAME_CHALLENGE)).await?;
                self.enter_state(SmtpState::Login);
                Ok(())
            }
            method => {
                self.send(&format!("500 Unsupported AUTH method: {}", method))
                    .await
            }
        }
    }

    async fn mail_from(&mut self, arg: &str) -> io::Result<()> {
        let mail_from = match parse_mail_from(arg, self.ctx.config.max_message_bytes) {
            Ok(mail_from) => mail_from,
            Err(e) => {
                warn!("Bad MAIL argument {:?}: {:?}", arg, e);
                return self.send(e.reply()).await;
            }
        };
        debug!(params = ?mail_from.params, "Mail sender is {}", mail_from.address);

        let origin = match self.ctx.manager.policy().parse_origin(&mail_from.address) {
            Ok(origin) => origin,
            Err(e) => {
                warn!(from = %mail_from.address, "Bad address as MAIL arg: {}", e);
                return self.send("501 Bad origin address syntax").await;
            }
        };

        let mut info = self.session_info();
        info.from = Some(Address::new(origin.address.clone()));
        let verdict = self
            .ctx
            .extensions
            .events
            .before_mail_from_accepted
            .emit(&info)
            .unwrap_or(SmtpResponse::Defer);

        if let Some(reply) = verdict.reply() {
            warn!("Extension denied mail from <{}>", origin.address);
            return self.send(&reply).await;
        }
        if verdict == SmtpResponse::Defer && !origin.should_accept() {
            warn!(domain = %origin.domain, "Bad domain sender");
            return self.send("501 Unauthorized domain").await;
        }

        info!("Mail from: {}", origin.address);
        let reply = format!("250 Roger, accepting mail from <{}>", origin.address);
        self.from = Some(origin);
        self.send(&reply).await?;
        self.enter_state(SmtpState::Mail);
        Ok(())
    }

    async fn mail_handler(&mut self, command: SmtpCommand, arg: &str) -> io::Result<()> {
        match command {
            SmtpCommand::Rcpt => self.rcpt_to(arg).await,
            SmtpCommand::Data => {
                if !arg.is_empty() {
                    warn!("Got unexpected args on DATA: {:?}", arg);
                    return self.send("501 DATA command should not have any arguments").await;
                }
                if self.recipients.is_empty() {
                    return self.out_of_sequence(command).await;
                }
                self.enter_state(SmtpState::Data);
                Ok(())
            }
            SmtpCommand::Ehlo => {
                debug!("Resetting session state on EHLO request");
                self.reset();
                self.send("250 Session reset").await
            }
            _ => self.out_of_sequence(command).await,
        }
    }

    async fn rcpt_to(&mut self, arg: &str) -> io::Result<()> {
        let Some(address) = parse_rcpt_to(arg) else {
            warn!("Bad RCPT argument: {:?}", arg);
            return self
                .send("501 Was expecting RCPT arg syntax of TO:<address>")
                .await;
        };
        let recipient = match self.ctx.manager.policy().new_recipient(address) {
            Ok(recipient) => recipient,
            Err(e) => {
                warn!(to = %address, "Bad address as RCPT arg: {}", e);
                return self.send("501 Bad recipient address syntax").await;
            }
        };

        let mut info = self.session_info();
        info.to.push(Address::new(recipient.address.clone()));
        let verdict = self
            .ctx
            .extensions
            .events
            .before_rcpt_to_accepted
            .emit(&info)
            .unwrap_or(SmtpResponse::Defer);

        if let Some(reply) = verdict.reply() {
            warn!("Extension denied mail to <{}>", recipient.address);
            return self.send(&reply).await;
        }
        if verdict == SmtpResponse::Defer && !recipient.should_accept() {
            warn!(to = %address, "Rejecting recipient domain");
            return self.send("550 Relay not permitted").await;
        }

        let max = self.ctx.config.max_recipients;
        if self.recipients.len() >= max {
            warn!("Limit of {} recipients exceeded", max);
            return self
                .send(&format!("552 Limit of {} recipients exceeded", max))
                .await;
        }

        debug!(to = %address, "Recipient added");
        let reply = format!("250 I'll make sure <{}> gets this", address);
        self.recipients.push(recipient);
        self.send(&reply).await
    }

    async fn data_handler(&mut self) -> io::Result<()> {
        self.send("354 Start mail input; end with <CRLF>.<CRLF>").await?;

        let content = match self.read_data().await {
            Ok(content) => content,
            Err(e) => {
                warn!("Error while reading DATA: {}", e);
                if e.kind() == io::ErrorKind::TimedOut {
                    self.send("221 Idle timeout, bye bye").await?;
                }
                self.enter_state(SmtpState::Quit);
                return Ok(());
            }
        };

        let Some(content) = content else {
            warn!(
                max = self.ctx.config.max_message_bytes,
                "Message exceeded the size limit"
            );
            self.reset();
            return self.send("552 Max message size exceeded").await;
        };

        let received = format!(
            "Received: from {} ([{}]) by {}\r\n",
            self.remote_domain,
            self.peer.ip(),
            self.ctx.config.domain
        );

        // DATA is only reachable from MAIL with at least one recipient
        debug_assert!(self.from.is_some());
        let delivered = self.from.as_ref().map_or(Ok(()), |from| {
            self.ctx
                .manager
                .deliver(from, &self.recipients, &received, &content)
        });
        let recipients = self.recipients.len();
        self.reset();

        match delivered {
            Ok(()) => {
                self.ctx.metrics.add_received(recipients);
                info!(size = content.len(), "Message accepted");
                self.send("250 Mail accepted for delivery").await
            }
            Err(e) => {
                warn!("Failed to deliver message: {}", e);
                self.ctx.metrics.inc_smtp_errors();
                self.send("451 Failed to store message").await
            }
        }
    }

    /// Reads dot-terminated content, removing dot-stuffing.
    ///
    /// Returns `None` when the content exceeded the size limit; the rest of
    /// the message is still consumed up to the terminator.
    async fn read_data(&mut self) -> io::Result<Option<Vec<u8>>> {
        let max = self.ctx.config.max_message_bytes;
        let mut data = Vec::new();
        let mut oversized = false;
        let mut line_start = true;
        let mut chunk = Vec::new();

        loop {
            chunk.clear();
            if self.stream.read_raw_line(&mut chunk, MAX_DATA_LINE).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed during DATA",
                ));
            }

            let mut content = chunk.as_slice();
            if line_start {
                if content == b".\r\n" || content == b".\n" {
                    break;
                }
                if content[0] == b'.' {
                    content = &content[1..];
                }
            }
            line_start = chunk.ends_with(b"\n");

            if oversized {
                continue;
            }
            if data.len() + content.len() > max {
                oversized = true;
                data = Vec::new();
            } else {
                data.extend_from_slice(content);
            }
        }

        debug!("Received {} bytes", data.len());
        Ok(if oversized { None } else { Some(data) })
    }

    async fn greet(&mut self) -> io::Result<()> {
        let greeting = format!("220 {} Mail catcher SMTP ready", self.ctx.config.domain);
        self.send(&greeting).await
    }

    async fn out_of_sequence(&mut self, command: SmtpCommand) -> io::Result<()> {
        warn!(state = %self.state, "Wasn't expecting {} here", command);
        self.send(&format!("503 Command {} is out of sequence", command))
            .await
    }

    async fn send(&mut self, line: &str) -> io::Result<()> {
        if line.starts_with('4') || line.starts_with('5') {
            self.ctx.metrics.inc_smtp_warns();
        }
        self.stream.send(line).await
    }

    fn reset(&mut self) {
        self.enter_state(SmtpState::Ready);
        self.from = None;
        self.recipients.clear();
    }

    fn enter_state(&mut self, state: SmtpState) {
        self.state = state;
        debug!("Entering state {}", state);
    }

    /// Envelope so far, for the "before accepted" hooks
    fn session_info(&self) -> SmtpSessionInfo {
        SmtpSessionInfo {
            from: self.from.as_ref().map(|o| Address::new(o.address.clone())),
            to: self
                .recipients
                .iter()
                .map(|r| Address::new(r.address.clone()))
                .collect(),
            remote_addr: self.peer.to_string(),
        }
    }
}

/// Authentication identity from an `AUTH PLAIN` response, for logging only
fn plain_auth_user(response: &str) -> String {
    STANDARD
        .decode(response)
        .ok()
        .and_then(|decoded| {
            decoded
                .split(|&b| b == 0)
                .nth(1)
                .map(|user| String::from_utf8_lossy(user).into_owned())
        })
        .unwrap_or_else(|| "<undecodable>".to_string())
}
