//! CLI parse and command tests.

use super::{Cli, CliCommand};
use clap::Parser;

pub(super) fn parse(args: &[&str]) -> CliCommand {
    let cli = Cli::try_parse_from(args).unwrap();
    cli.command
}


#[test]
fn cli_parse_sources_and_purge() {
    assert!(matches!(parse(&["depot", "sources"]), CliCommand::Sources));
    assert!(matches!(parse(&["depot", "purge"]), CliCommand::Purge));
}

#[test]
fn cli_parse_refresh() {
    match parse(&["depot", "refresh"]) {
        CliCommand::Refresh { force } => assert!(!force),
        _ => panic!("expected Refresh"),
    }
    match parse(&["depot", "refresh", "--force"]) {
        CliCommand::Refresh { force } => assert!(force),
        _ => panic!("expected Refresh with force"),
    }
}

#[test]
fn cli_parse_download() {
    match parse(&["depot", "download", "reqs.json", "--serial"]) {
        CliCommand::Download { requests, serial } => {
            assert_eq!(requests, std::path::PathBuf::from("reqs.json"));
            assert!(serial);
        }
        _ => panic!("expected Download"),
    }
    assert!(Cli::try_parse_from(["depot", "download"]).is_err());
}
