//! LMTP command lines (RFC 2033, which reuses the RFC 5321 verbs).

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// LHLO <domain>
    Lhlo(String),
    /// HELO or EHLO, which an LMTP server must refuse.
    Helo(String),
    /// MAIL FROM:<reverse-path> [SP <mail-parameters>]
    Mail {
        address: String,
        parameters: Vec<String>,
    },
    /// RCPT TO:<forward-path> [SP <rcpt-parameters>]
    Rcpt {
        address: String,
        parameters: Vec<String>,
    },
    Data,
    Rset,
    Noop,
    Vrfy(String),
    Quit,
    /// A verb we recognise but whose arguments do not parse.
    Syntax(String),
    Unknown(String),
}

/// Parse one command line, with or without its line ending.
pub fn parse_command(input: &str) -> Command {
    let input = input.trim_end_matches(['\r', '\n']);

    let (verb, args) = match input.find(' ') {
        Some(pos) => (&input[..pos], input[pos + 1..].trim()),
        None => (input, ""),
    };

    match verb.to_ascii_uppercase().as_str() {
        "LHLO" if !args.is_empty() => Command::Lhlo(args.to_string()),
        "HELO" | "EHLO" => Command::Helo(args.to_string()),
        "MAIL" => match strip_prefix_ignore_case(args, "FROM:").and_then(parse_path) {
            Some((address, parameters)) => Command::Mail {
                address,
                parameters,
            },
            None => Command::Syntax(input.to_string()),
        },
        "RCPT" => match strip_prefix_ignore_case(args, "TO:").and_then(parse_path) {
            Some((address, parameters)) => Command::Rcpt {
                address,
                parameters,
            },
            None => Command::Syntax(input.to_string()),
        },
        "DATA" => Command::Data,
        "RSET" => Command::Rset,
        "NOOP" => Command::Noop,
        "VRFY" => Command::Vrfy(args.to_string()),
        "QUIT" => Command::Quit,
        "LHLO" => Command::Syntax(input.to_string()),
        _ => Command::Unknown(input.to_string()),
    }
}

fn strip_prefix_ignore_case<'a>(input: &'a str, prefix: &str) -> Option<&'a str> {
    let head = input.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &input[prefix.len()..])
}

/// `<address> [parameters]`; `<>` is the null path.
fn parse_path(input: &str) -> Option<(String, Vec<String>)> {
    let input = input.trim().strip_prefix('<')?;
    let end = input.find('>')?;
    let address = input[..end].to_string();
    let parameters = input[end + 1..]
        .split_whitespace()
        .map(str::to_string)
        .collect();
    Some((address, parameters))
}
