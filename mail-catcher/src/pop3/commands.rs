use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pop3Command {
    Quit,
    Stat,
    List,
    Retr,
    Dele,
    Noop,
    Rset,
    Top,
    Uidl,
    User,
    Pass,
    Apop,
    Capa,
    Stls,
}

impl Pop3Command {
    pub fn from_verb(verb: &str) -> Option<Self> {
        let command = match verb {
            "QUIT" => Pop3Command::Quit,
            "STAT" => Pop3Command::Stat,
            "LIST" => Pop3Command::List,
            "RETR" => Pop3Command::Retr,
            "DELE" => Pop3Command::Dele,
            "NOOP" => Pop3Command::Noop,
            "RSET" => Pop3Command::Rset,
            "TOP" => Pop3Command::Top,
            "UIDL" => Pop3Command::Uidl,
            "USER" => Pop3Command::User,
            "PASS" => Pop3Command::Pass,
            "APOP" => Pop3Command::Apop,
            "CAPA" => Pop3Command::Capa,
            "STLS" => Pop3Command::Stls,
            _ => return None,
        };
        Some(command)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Pop3Command::Quit => "QUIT",
            Pop3Command::Stat => "STAT",
            Pop3Command::List => "LIST",
            Pop3Command::Retr => "RETR",
            Pop3Command::Dele => "DELE",
            Pop3Command::Noop => "NOOP",
            Pop3Command::Rset => "RSET",
            Pop3Command::Top => "TOP",
            Pop3Command::Uidl => "UIDL",
            Pop3Command::User => "USER",
            Pop3Command::Pass => "PASS",
            Pop3Command::Apop => "APOP",
            Pop3Command::Capa => "CAPA",
            Pop3Command::Stls => "STLS",
        }
    }
}

impl fmt::Display for Pop3Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    Empty,
    /// Holds the upper-cased verb
    Unrecognized(String),
    Command(Pop3Command, Vec<String>),
}

impl CommandLine {
    /// Splits on whitespace; the first word is the verb.
    pub fn parse(line: &str) -> Self {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return CommandLine::Empty;
        };
        let verb = verb.to_uppercase();
        match Pop3Command::from_verb(&verb) {
            Some(command) => CommandLine::Command(command, words.map(str::to_string).collect()),
            None => CommandLine::Unrecognized(verb),
        }
    }
}

/// Validates a 1-based message number against a mailbox of `count` messages.
///
/// The error is the reply to send, with `what` naming the argument in it,
/// e.g. `LIST` or `TOP first`.
pub fn parse_message_number(arg: &str, count: usize, what: &str) -> Result<usize, String> {
    let number: i32 = arg
        .parse()
        .map_err(|_| format!("-ERR {} command requires an integer argument", command_of(what)))?;
    if number < 1 {
        return Err(format!("-ERR {} argument must be greater than 0", what));
    }
    let number = number as usize;
    if number > count {
        return Err(format!(
            "-ERR {} argument must not exceed the number of messages",
            what
        ));
    }
    Ok(number)
}

fn command_of(what: &str) -> &str {
    what.split(' ').next().unwrap_or(what)
}
