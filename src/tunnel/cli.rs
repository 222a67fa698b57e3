//! CLI surface (§6): `<quic_addr> <quic_port> <local_addr> <local_port>` plus the interactive
//! mode prompt, taken with `clap`'s derive parser the way both tunnel binaries read their argv.

use std::io::{self, BufRead, Write};

use clap::Parser;

use crate::multiplex::Mode;
use crate::result::{QuicheError, QuicheResult};

#[derive(Parser, Debug, Clone)]
#[command(about = "QUIC tunnel endpoint multiplexing OpenFlow and OVSDB")]
pub struct Cli {
    /// Address of the remote QUIC endpoint.
    pub quic_addr: String,
    pub quic_port: u16,
    /// Address the local OpenFlow/OVSDB sink binds or listens on.
    pub local_addr: String,
    pub local_port: u16,
}

/// Prompts on stdin for the multiplex mode (§4.7, §6): `1`=OpenFlow, `2`=OVSDB, `3`=multiplexed.
pub fn prompt_mode() -> QuicheResult<Mode> {
    print!("select mode (1=OpenFlow, 2=OVSDB, 3=multiplexed): ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    parse_mode(&line)
}

fn parse_mode(line: &str) -> QuicheResult<Mode> {
    let choice: u32 = line.trim().parse().map_err(|_| QuicheError::Msg("mode must be a number".into()))?;
    Mode::from_prompt(choice).ok_or_else(|| QuicheError::Msg("mode must be 1, 2, or 3".into()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_each_valid_mode_choice() {
        assert!(matches!(parse_mode("1\n").unwrap(), Mode::OpenFlowOnly));
        assert!(matches!(parse_mode("2\n").unwrap(), Mode::OvsdbOnly));
        assert!(matches!(parse_mode("3\n").unwrap(), Mode::Multiplexed));
    }

    #[test]
    fn rejects_an_out_of_range_or_non_numeric_choice() {
        assert!(parse_mode("9\n").is_err());
        assert!(parse_mode("openflow\n").is_err());
    }

    #[test]
    fn cli_parses_positional_args() {
        let cli = Cli::parse_from(["qsdn-client", "10.0.0.1", "4433", "127.0.0.1", "6633"]);
        assert_eq!(cli.quic_addr, "10.0.0.1");
        assert_eq!(cli.quic_port, 4433);
        assert_eq!(cli.local_addr, "127.0.0.1");
        assert_eq!(cli.local_port, 6633);
    }
}
