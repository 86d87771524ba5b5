use crate::policy::parse_email_address;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

/// Captures the reverse-path and the optional ESMTP parameters. `>` may
/// appear escaped or inside a quoted local part; `AUTH=<>` is allowed.
const MAIL_FROM_PATTERN: &str =
    r#"(?i)^FROM:\s*<((?:(?:\\>|[^>])+|"[^"]+"@[^>])+)?>( ([\w= ]|=<>)+)?$"#;

const ESMTP_PARAM_PATTERN: &str = r"(?i) ([0-9A-Z_]+)=([0-9A-Z_]+|<>)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpCommand {
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Send,
    Soml,
    Saml,
    Vrfy,
    Expn,
    Help,
    Noop,
    Quit,
    Turn,
    StartTls,
    Auth,
}

impl SmtpCommand {
    pub fn from_verb(verb: &str) -> Option<Self> {
        let command = match verb {
            "HELO" => SmtpCommand::Helo,
            "EHLO" => SmtpCommand::Ehlo,
            "MAIL" => SmtpCommand::Mail,
            "RCPT" => SmtpCommand::Rcpt,
            "DATA" => SmtpCommand::Data,
            "RSET" => SmtpCommand::Rset,
            "SEND" => SmtpCommand::Send,
            "SOML" => SmtpCommand::Soml,
            "SAML" => SmtpCommand::Saml,
            "VRFY" => SmtpCommand::Vrfy,
            "EXPN" => SmtpCommand::Expn,
            "HELP" => SmtpCommand::Help,
            "NOOP" => SmtpCommand::Noop,
            "QUIT" => SmtpCommand::Quit,
            "TURN" => SmtpCommand::Turn,
            "STARTTLS" => SmtpCommand::StartTls,
            "AUTH" => SmtpCommand::Auth,
            _ => return None,
        };
        Some(command)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SmtpCommand::Helo => "HELO",
            SmtpCommand::Ehlo => "EHLO",
            SmtpCommand::Mail => "MAIL",
            SmtpCommand::Rcpt => "RCPT",
            SmtpCommand::Data => "DATA",
            SmtpCommand::Rset => "RSET",
            SmtpCommand::Send => "SEND",
            SmtpCommand::Soml => "SOML",
            SmtpCommand::Saml => "SAML",
            SmtpCommand::Vrfy => "VRFY",
            SmtpCommand::Expn => "EXPN",
            SmtpCommand::Help => "HELP",
            SmtpCommand::Noop => "NOOP",
            SmtpCommand::Quit => "QUIT",
            SmtpCommand::Turn => "TURN",
            SmtpCommand::StartTls => "STARTTLS",
            SmtpCommand::Auth => "AUTH",
        }
    }

    /// Legacy commands answered with `502` in every state
    pub fn is_unimplemented(&self) -> bool {
        matches!(
            self,
            SmtpCommand::Send
                | SmtpCommand::Soml
                | SmtpCommand::Saml
                | SmtpCommand::Expn
                | SmtpCommand::Help
                | SmtpCommand::Turn
        )
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command line split into its verb and argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// Blank line
    Empty,
    /// Verb shorter than four characters
    Garbled,
    /// Well-formed but not an SMTP verb; holds the upper-cased verb
    Unrecognized(String),
    Command(SmtpCommand, String),
}

impl CommandLine {
    /// Splits at the first space. The verb is upper-cased, the argument has
    /// surrounding spaces removed.
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, arg) = match line.find(' ') {
            Some(idx) => (&line[..idx], line[idx + 1..].trim_matches(' ')),
            None => (line, ""),
        };

        if verb.is_empty() {
            return CommandLine::Empty;
        }
        if verb.len() < 4 {
            return CommandLine::Garbled;
        }

        let verb = verb.to_uppercase();
        match SmtpCommand::from_verb(&verb) {
            Some(command) => CommandLine::Command(command, arg.to_string()),
            None => CommandLine::Unrecognized(verb),
        }
    }
}

/// The domain a client announced in `HELO`/`EHLO`
pub fn parse_hello_argument(arg: &str) -> Option<&str> {
    let domain = match arg.find(' ') {
        Some(idx) => &arg[..idx],
        None => arg,
    };
    if domain.is_empty() {
        None
    } else {
        Some(domain)
    }
}

/// Parsed `MAIL FROM` argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailFrom {
    /// Reverse-path, or `unspecified` for the null sender
    pub address: String,
    /// ESMTP parameters with upper-cased keys
    pub params: HashMap<String, String>,
}

/// Why a `MAIL FROM` argument was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailFromError {
    Syntax,
    BadSender,
    BadParams,
    BadSize,
    TooLarge,
}

impl MailFromError {
    pub fn reply(&self) -> &'static str {
        match self {
            MailFromError::Syntax => "501 Was expecting MAIL arg syntax of FROM:<address>",
            MailFromError::BadSender => "501 Bad sender address syntax",
            MailFromError::BadParams => "501 Unable to parse MAIL ESMTP parameters",
            MailFromError::BadSize => "501 Unable to parse SIZE as an integer",
            MailFromError::TooLarge => "552 Max message size exceeded",
        }
    }
}

fn mail_from_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(MAIL_FROM_PATTERN).expect("MAIL FROM pattern is valid"))
}

fn esmtp_param_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(ESMTP_PARAM_PATTERN).expect("ESMTP parameter pattern is valid"))
}

/// Parses `FROM:<address> [PARAM=value ...]`, refusing an advertised `SIZE`
/// above `max_message_bytes`.
pub fn parse_mail_from(arg: &str, max_message_bytes: usize) -> Result<MailFrom, MailFromError> {
    let captures = mail_from_regex()
        .captures(arg)
        .ok_or(MailFromError::Syntax)?;

    let sender = captures.get(1).map(|m| m.as_str()).unwrap_or("");
    if !sender.is_empty() && parse_email_address(sender).is_err() {
        return Err(MailFromError::BadSender);
    }
    let address = if sender.is_empty() {
        "unspecified".to_string()
    } else {
        sender.to_string()
    };

    let mut params = HashMap::new();
    if let Some(raw) = captures.get(2).map(|m| m.as_str()).filter(|s| !s.is_empty()) {
        params = parse_esmtp_params(raw).ok_or(MailFromError::BadParams)?;
        if let Some(size) = params.get("SIZE").filter(|s| !s.is_empty()) {
            let size: i32 = size.parse().map_err(|_| MailFromError::BadSize)?;
            if usize::try_from(size).map_or(false, |size| size > max_message_bytes) {
                return Err(MailFromError::TooLarge);
            }
        }
    }

    Ok(MailFrom { address, params })
}

/// Collects `" KEY=value"` pairs. The leading space is mandatory.
fn parse_esmtp_params(raw: &str) -> Option<HashMap<String, String>> {
    let params: HashMap<String, String> = esmtp_param_regex()
        .captures_iter(raw)
        .map(|c| (c[1].to_uppercase(), c[2].to_string()))
        .collect();
    if params.is_empty() {
        None
    } else {
        Some(params)
    }
}

/// Extracts the forward-path from `TO:<address>`. Angle brackets are optional.
pub fn parse_rcpt_to(arg: &str) -> Option<&str> {
    if arg.len() < 4 {
        return None;
    }
    let prefix = arg.get(..3)?;
    if !prefix.eq_ignore_ascii_case("TO:") {
        return None;
    }
    Some(arg[3..].trim_matches(|c| c == '<' || c == '>' || c == ' '))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns_compile() {
        assert!(mail_from_regex().is_match("FROM:<a@b.com>"));
        assert!(esmtp_param_regex().is_match(" SIZE=10"));
    }

    #[test]
    fn test_parse_command_line() {
        assert_eq!(CommandLine::parse(""), CommandLine::Empty);
        assert_eq!(CommandLine::parse("HI"), CommandLine::Garbled);
        assert_eq!(CommandLine::parse("HI there"), CommandLine::Garbled);
        assert_eq!(
            CommandLine::parse("hello"),
            CommandLine::Unrecognized("HELLO".to_string())
        );
        assert_eq!(
            CommandLine::parse("helo  example.com "),
            CommandLine::Command(SmtpCommand::Helo, "example.com".to_string())
        );
        assert_eq!(
            CommandLine::parse("starttls\r\n"),
            CommandLine::Command(SmtpCommand::StartTls, String::new())
        );
    }

    #[test]
    fn test_hello_argument() {
        assert_eq!(parse_hello_argument("mydomain"), Some("mydomain"));
        assert_eq!(parse_hello_argument("mydomain extra"), Some("mydomain"));
        assert_eq!(parse_hello_argument(""), None);
    }

    #[test]
    fn test_mail_from_accepts() {
        for arg in [
            "FROM:<john@gmail.com>",
            "FROM: <john@gmail.com>",
            "from:<john@gmail.com> BODY=8BITMIME",
            "FROM:<john@gmail.com> SIZE=1024",
            "FROM:<host!host!user/data@foo.com>",
            "FROM:<\"first last\"@space.com>",
            "FROM:<user\\@internal@external.com>",
            "FROM:<user\\>name@host.com>",
            "FROM:<\"user>name\"@host.com>",
            "FROM:<\"user@internal\"@external.com>",
            "FROM:<john@gmail.com> AUTH=<>",
        ] {
            assert!(parse_mail_from(arg, 10_000).is_ok(), "{} should parse", arg);
        }
    }

    #[test]
    fn test_mail_from_null_sender() {
        let from = parse_mail_from("FROM:<>", 100).unwrap();
        assert_eq!(from.address, "unspecified");
        assert!(from.params.is_empty());
    }

    #[test]
    fn test_mail_from_params() {
        let from = parse_mail_from("FROM:<a@b.com> body=8BITMIME SIZE=12", 100).unwrap();
        assert_eq!(from.address, "a@b.com");
        assert_eq!(from.params.get("BODY").map(String::as_str), Some("8BITMIME"));
        assert_eq!(from.params.get("SIZE").map(String::as_str), Some("12"));
    }

    #[test]
    fn test_mail_from_rejects() {
        let cases = [
            ("", MailFromError::Syntax),
            ("FROM john@gmail.com", MailFromError::Syntax),
            ("FROM:john@gmail.com", MailFromError::Syntax),
            ("FROM:<john@gmail.com> SIZE=147KB", MailFromError::BadSize),
            ("FROM: <john@gmail.com> SIZE147", MailFromError::BadParams),
            ("FROM:<first@last@gmail.com>", MailFromError::BadSender),
            ("FROM:<first last@gmail.com>", MailFromError::BadSender),
            ("FROM:<john@gmail.com> SIZE=4096", MailFromError::TooLarge),
            ("FROM:<john@gmail.com> SIZE=99999999999", MailFromError::BadSize),
        ];
        for (arg, expected) in cases {
            assert_eq!(parse_mail_from(arg, 1024), Err(expected), "{}", arg);
        }
    }

    #[test]
    fn test_rcpt_to() {
        assert_eq!(parse_rcpt_to("TO:<u1@gmail.com>"), Some("u1@gmail.com"));
        assert_eq!(parse_rcpt_to("to: <u2@gmail.com>"), Some("u2@gmail.com"));
        assert_eq!(parse_rcpt_to("TO:u3@gmail.com"), Some("u3@gmail.com"));
        assert_eq!(parse_rcpt_to("TO"), None);
        assert_eq!(parse_rcpt_to("TO james@gmail.com"), None);
    }
}
