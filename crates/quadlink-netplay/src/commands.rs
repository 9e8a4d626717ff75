//! Chat-line command parser.
//!
//! Lines starting with `/` are commands; anything else is chat. Parsing
//! never touches the network: errors are local status lines only.

use quadlink_netproto::constants::DEFAULT_PORT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Name(String),
    Host { port: u16 },
    Join { host: String, port: u16 },
    Start,
    /// Room lag: applied locally and sent as the room value.
    Lag(u8),
    /// Source lag: this user only.
    MyLag(u8),
    /// Target lag: sent as the room value without touching local lag.
    YourLag(u8),
    Autolag,
    Golf,
    Chat(String),
}

pub fn parse_line(line: &str) -> Result<Command, String> {
    if !line.starts_with('/') {
        return Ok(Command::Chat(line.to_string()));
    }
    let mut params = line.split_whitespace();
    let command = params.next().unwrap_or("/");
    match command {
        "/name" => Ok(Command::Name(required(params.next())?.to_string())),
        "/host" | "/server" => Ok(Command::Host {
            port: optional_port(params.next())?,
        }),
        "/join" | "/connect" => Ok(Command::Join {
            host: required(params.next())?.to_string(),
            port: optional_port(params.next())?,
        }),
        "/start" => Ok(Command::Start),
        "/lag" => Ok(Command::Lag(lag_value(params.next())?)),
        "/my_lag" => Ok(Command::MyLag(lag_value(params.next())?)),
        "/your_lag" => Ok(Command::YourLag(lag_value(params.next())?)),
        "/autolag" => Ok(Command::Autolag),
        "/golf" => Ok(Command::Golf),
        other => Err(format!("Unknown command: {other}")),
    }
}

fn required(param: Option<&str>) -> Result<&str, String> {
    param.ok_or_else(|| "Missing parameter.".to_string())
}

fn optional_port(param: Option<&str>) -> Result<u16, String> {
    match param {
        None => Ok(DEFAULT_PORT),
        Some(raw) => raw.parse().map_err(|_| format!("Bad port: {raw}")),
    }
}

fn lag_value(param: Option<&str>) -> Result<u8, String> {
    required(param)?
        .parse()
        .map_err(|_| "Lag must be between 0 and 255.".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_chat() {
        assert_eq!(
            parse_line("hello there"),
            Ok(Command::Chat("hello there".into()))
        );
    }

    #[test]
    fn commands_parse_with_defaults_and_aliases() {
        assert_eq!(parse_line("/name bob"), Ok(Command::Name("bob".into())));
        assert_eq!(parse_line("/host"), Ok(Command::Host { port: DEFAULT_PORT }));
        assert_eq!(parse_line("/server 7000"), Ok(Command::Host { port: 7000 }));
        assert_eq!(
            parse_line("/join example.net 7000"),
            Ok(Command::Join {
                host: "example.net".into(),
                port: 7000
            })
        );
        assert_eq!(
            parse_line("/connect example.net"),
            Ok(Command::Join {
                host: "example.net".into(),
                port: DEFAULT_PORT
            })
        );
        assert_eq!(parse_line("/start"), Ok(Command::Start));
        assert_eq!(parse_line("/lag 3"), Ok(Command::Lag(3)));
        assert_eq!(parse_line("/my_lag 2"), Ok(Command::MyLag(2)));
        assert_eq!(parse_line("/your_lag 4"), Ok(Command::YourLag(4)));
        assert_eq!(parse_line("/autolag"), Ok(Command::Autolag));
        assert_eq!(parse_line("/golf"), Ok(Command::Golf));
    }

    #[test]
    fn errors_stay_local() {
        assert_eq!(parse_line("/name"), Err("Missing parameter.".into()));
        assert_eq!(parse_line("/join"), Err("Missing parameter.".into()));
        assert_eq!(parse_line("/warp"), Err("Unknown command: /warp".into()));
        assert!(parse_line("/lag 300").is_err());
        assert!(parse_line("/host nan").is_err());
    }
}
