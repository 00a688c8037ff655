//! Unit tests for CLI commands

use crate::cli::{load_config, Cli, Commands, Model};
use clap::Parser;
use std::io::Write;

#[test]
fn test_serve_defaults() {
    let cli = Cli::try_parse_from(["forkserve", "serve"]).unwrap();
    match cli.command {
        Commands::Serve {
            config,
            addr,
            model,
            echo,
        } => {
            assert!(config.is_none());
            assert!(addr.is_none());
            assert_eq!(model, Model::Threaded);
            assert_eq!(echo, vec!["/".to_string()]);
        }
        _ => panic!("Expected Serve command"),
    }
}

#[test]
fn test_serve_with_flags() {
    let cli = Cli::try_parse_from([
        "forkserve",
        "serve",
        "--model",
        "process",
        "--addr",
        "127.0.0.1:9090",
        "--echo",
        "/a",
        "--echo",
        "/b",
    ])
    .unwrap();
    match cli.command {
        Commands::Serve {
            addr, model, echo, ..
        } => {
            assert_eq!(addr.as_deref(), Some("127.0.0.1:9090"));
            assert_eq!(model, Model::Process);
            assert_eq!(echo, vec!["/a".to_string(), "/b".to_string()]);
        }
        _ => panic!("Expected Serve command"),
    }
}

#[test]
fn test_unknown_model_rejected() {
    assert!(Cli::try_parse_from(["forkserve", "serve", "--model", "fibers"]).is_err());
}

#[test]
fn test_check_config_requires_file() {
    assert!(Cli::try_parse_from(["forkserve", "check-config"]).is_err());
    let cli = Cli::try_parse_from(["forkserve", "check-config", "--config", "f.yaml"]).unwrap();
    assert!(matches!(cli.command, Commands::CheckConfig { .. }));
}

#[test]
fn test_load_config_file_and_addr_override() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "port: 7000\nmin_children: 2\nmax_children: 4").unwrap();

    let config = load_config(Some(file.path()), Some("127.0.0.1:7100")).unwrap();
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.port, 7100);
    assert_eq!(config.min_children, 2);
    assert_eq!(config.max_children(), Some(4));
}

#[test]
fn test_load_config_rejects_invalid_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "min_children: 5\nmax_children: 1").unwrap();
    let err = load_config(Some(file.path()), None).unwrap_err();
    assert!(format!("{err:#}").contains("max_children is set lower than min_children"));
}
