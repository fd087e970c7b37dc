//! Command line option handling.
//!
//! The derived parser collects repeated flags into per-flag lists, but
//! `--set` binds to the most recently declared `--controller`, so the
//! relative order of the two flags matters. A second pass over the raw
//! arguments recovers that interleaving.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ErrorKind, Parser};
use nix::unistd::{Gid, Group, Uid, User};

use crate::cgroups::ControllerConfig;

pub const DEFAULT_GRACE_MICROS: u64 = 500_000;
pub const MAX_GRACE_MICROS: u64 = 1_000_000;

pub const USAGE: &str = "\
Usage: cgtether [OPTIONS] -- <program> [args...]

Run <program> inside one or more cgroups and clean up everything it
started when the launching process goes away.

Options:
  -c, --controller NAME        cgroup controller to use (repeatable)
  -p, --path REL               cgroup path shared by all controllers
  -s, --set KEY=VALUE          write VALUE to KEY in the most recently
                               declared controller (repeatable)
  -k, --delay-to-sigkill USEC  microseconds between SIGTERM and SIGKILL
                               (0..=1000000, default 500000)
  -u, --uid USER_OR_UID        run the program as this user
  -g, --gid GROUP_OR_GID       run the program with this group
  -h, --help                   print this message
";

/// Commandline option definition, as handed over by the host runtime.
#[derive(Parser, Debug)]
#[clap(name = "cgtether")]
#[clap(override_usage = "cgtether [OPTIONS] -- <program> [args...]")]
struct Opts {
    /// cgroup controller to use (repeatable)
    #[clap(short, long, value_name = "NAME")]
    controller: Vec<String>,
    /// cgroup path shared by all controllers
    #[clap(short, long, value_name = "REL")]
    path: Option<String>,
    /// KEY=VALUE setting for the most recently declared controller
    #[clap(short, long, value_name = "KEY=VALUE")]
    set: Vec<String>,
    /// microseconds between SIGTERM and SIGKILL
    #[clap(short = 'k', long, value_name = "USEC")]
    delay_to_sigkill: Option<u64>,
    /// run the program as this user
    #[clap(short, long, value_name = "USER_OR_UID")]
    uid: Option<String>,
    /// run the program with this group
    #[clap(short, long, value_name = "GROUP_OR_GID")]
    gid: Option<String>,
    /// program to run and its arguments
    #[clap(
        value_name = "PROGRAM",
        last = true,
        allow_hyphen_values = true,
        required = true
    )]
    command: Vec<String>,
}

/// Everything the rest of the program needs, frozen at start-up.
#[derive(Debug)]
pub struct Config {
    pub cgroup_path: Option<String>,
    pub controllers: Vec<ControllerConfig>,
    pub grace: Duration,
    pub uid: Option<Uid>,
    pub gid: Option<Gid>,
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug)]
pub enum Parsed {
    Run(Config),
    Help,
}

pub fn parse(args: &[String]) -> Result<Parsed> {
    let opts = match Opts::try_parse_from(args) {
        Ok(opts) => opts,
        Err(err) if err.kind() == ErrorKind::DisplayHelp => return Ok(Parsed::Help),
        Err(err) => bail!("{}", err),
    };

    Ok(Parsed::Run(Config::from_opts(opts, args)?))
}

impl Config {
    fn from_opts(opts: Opts, args: &[String]) -> Result<Self> {
        if let Some(path) = &opts.path {
            if path.is_empty() {
                bail!("--path must not be empty");
            }
            if path.starts_with('/') {
                bail!("--path must be relative to the controller root");
            }
        }

        let controllers = pair_settings(&opts, args)?;

        match (&opts.path, controllers.is_empty()) {
            (Some(_), true) => bail!("--path requires at least one --controller"),
            (None, false) => bail!("--controller requires --path"),
            _ => {}
        }

        let grace_micros = match opts.delay_to_sigkill {
            Some(micros) if micros > MAX_GRACE_MICROS => bail!(
                "--delay-to-sigkill {} exceeds the maximum of {}",
                micros,
                MAX_GRACE_MICROS
            ),
            Some(micros) => micros,
            None => DEFAULT_GRACE_MICROS,
        };

        let uid = opts.uid.as_deref().map(resolve_uid).transpose()?;
        let gid = opts.gid.as_deref().map(resolve_gid).transpose()?;

        let program = match opts.command.first() {
            Some(program) => program.clone(),
            None => bail!("missing program to run after --"),
        };

        Ok(Self {
            cgroup_path: opts.path,
            controllers,
            grace: Duration::from_micros(grace_micros),
            uid,
            gid,
            program,
            args: opts.command,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagEvent {
    Controller,
    Set,
}

/// Rebuilds the controller list with each `--set` attached to the most
/// recently declared `--controller`, using the raw argument order.
fn pair_settings(opts: &Opts, args: &[String]) -> Result<Vec<ControllerConfig>> {
    let mut controllers: Vec<ControllerConfig> = opts
        .controller
        .iter()
        .map(|name| ControllerConfig::new(name))
        .collect();

    let events = flag_events(args);
    let declared_total = events
        .iter()
        .filter(|event| **event == FlagEvent::Controller)
        .count();
    if declared_total != controllers.len() || events.len() - declared_total != opts.set.len() {
        bail!("could not reconstruct the --controller/--set order");
    }

    let mut values = opts.set.iter();
    let mut declared = 0;
    for event in events {
        match event {
            FlagEvent::Controller => declared += 1,
            FlagEvent::Set => {
                let setting = values
                    .next()
                    .ok_or_else(|| anyhow!("could not reconstruct the --controller/--set order"))?;
                let (key, value) = split_setting(setting)?;
                if declared == 0 {
                    bail!("--set must come after a --controller");
                }
                controllers[declared - 1].settings.push((key, value));
            }
        }
    }

    Ok(controllers)
}

/// One event per `-c`/`-s` occurrence, in command line order. All four
/// spellings of each flag are recognized; scanning stops at `--`.
fn flag_events(args: &[String]) -> Vec<FlagEvent> {
    let mut events = Vec::new();
    for arg in args.iter().skip(1) {
        if arg == "--" {
            break;
        }
        if is_occurrence(arg, 'c', "controller") {
            events.push(FlagEvent::Controller);
        } else if is_occurrence(arg, 's', "set") {
            events.push(FlagEvent::Set);
        }
    }
    events
}

fn is_occurrence(arg: &str, short: char, long: &str) -> bool {
    if let Some(rest) = arg.strip_prefix("--") {
        // "--controller NAME" or "--controller=NAME".
        rest == long || (rest.starts_with(long) && rest[long.len()..].starts_with('='))
    } else if let Some(rest) = arg.strip_prefix('-') {
        // "-c NAME" or "-cNAME"; no other short flag starts with the
        // same letter, and flag values never lead with a dash.
        rest.starts_with(short)
    } else {
        false
    }
}

/// Splits a `--set` argument on its first `=`. The value may be empty and
/// may itself contain `=`.
fn split_setting(setting: &str) -> Result<(String, String)> {
    match setting.split_once('=') {
        Some((key, value)) => Ok((key.to_owned(), value.to_owned())),
        None => bail!("--set {:?} is missing a '='", setting),
    }
}

fn resolve_uid(raw: &str) -> Result<Uid> {
    let uid = match raw.parse::<libc::uid_t>() {
        Ok(id) => Uid::from_raw(id),
        Err(_) => {
            User::from_name(raw)
                .with_context(|| format!("failed to look up user {:?}", raw))?
                .ok_or_else(|| anyhow!("unknown user {:?}", raw))?
                .uid
        }
    };

    if uid.is_root() {
        bail!("running as uid 0 is not allowed");
    }
    Ok(uid)
}

fn resolve_gid(raw: &str) -> Result<Gid> {
    let gid = match raw.parse::<libc::gid_t>() {
        Ok(id) => Gid::from_raw(id),
        Err(_) => {
            Group::from_name(raw)
                .with_context(|| format!("failed to look up group {:?}", raw))?
                .ok_or_else(|| anyhow!("unknown group {:?}", raw))?
                .gid
        }
    };

    if gid.as_raw() == 0 {
        bail!("running as gid 0 is not allowed");
    }
    Ok(gid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::TestResult;

    fn parse_line(line: &[&str]) -> Result<Config> {
        let args: Vec<String> = line.iter().map(|arg| arg.to_string()).collect();
        match parse(&args)? {
            Parsed::Run(config) => Ok(config),
            Parsed::Help => panic!("unexpected help request"),
        }
    }

    #[test]
    fn parses_a_plain_command() {
        let config = parse_line(&["cgtether", "--", "/bin/echo", "hello"]).expect("parse");
        assert_eq!(config.program, "/bin/echo");
        assert_eq!(config.args, vec!["/bin/echo", "hello"]);
        assert!(config.controllers.is_empty());
        assert!(config.cgroup_path.is_none());
        assert_eq!(config.grace, Duration::from_micros(DEFAULT_GRACE_MICROS));
        assert!(config.uid.is_none());
        assert!(config.gid.is_none());
    }

    #[test]
    fn pairs_each_set_with_the_most_recent_controller() {
        let config = parse_line(&[
            "cgtether",
            "-c",
            "memory",
            "-s",
            "memory.limit_in_bytes=1048576",
            "-c",
            "cpu",
            "-s",
            "cpu.shares=512",
            "-s",
            "cpu.cfs_quota_us=10000",
            "-p",
            "scope/job1",
            "--",
            "sleep",
            "30",
        ])
        .expect("parse");

        assert_eq!(config.cgroup_path.as_deref(), Some("scope/job1"));
        assert_eq!(config.controllers.len(), 2);
        assert_eq!(config.controllers[0].name, "memory");
        assert_eq!(
            config.controllers[0].settings,
            vec![("memory.limit_in_bytes".into(), "1048576".into())]
        );
        assert_eq!(config.controllers[1].name, "cpu");
        assert_eq!(
            config.controllers[1].settings,
            vec![
                ("cpu.shares".into(), "512".into()),
                ("cpu.cfs_quota_us".into(), "10000".into())
            ]
        );
    }

    #[test]
    fn pairing_recognizes_every_flag_spelling() {
        let config = parse_line(&[
            "cgtether",
            "--controller=memory",
            "--set=memory.limit_in_bytes=1048576",
            "-ccpu",
            "-scpu.shares=512",
            "--path",
            "scope/job1",
            "--",
            "true",
        ])
        .expect("parse");

        assert_eq!(
            config.controllers[0].settings,
            vec![("memory.limit_in_bytes".into(), "1048576".into())]
        );
        assert_eq!(
            config.controllers[1].settings,
            vec![("cpu.shares".into(), "512".into())]
        );
    }

    #[test]
    fn set_values_may_be_empty_or_contain_equals() {
        let config = parse_line(&[
            "cgtether", "-c", "devices", "-p", "j", "-s", "devices.allow=a *:* rwm=x", "-s",
            "devices.deny=", "--", "true",
        ])
        .expect("parse");

        assert_eq!(
            config.controllers[0].settings,
            vec![
                ("devices.allow".into(), "a *:* rwm=x".into()),
                ("devices.deny".into(), "".into())
            ]
        );
    }

    #[test]
    fn rejects_a_set_before_any_controller() {
        let err = parse_line(&["cgtether", "-s", "a=b", "-c", "cpu", "-p", "j", "--", "true"])
            .expect_err("parse must fail");
        assert!(err.to_string().contains("--set must come after"));
    }

    #[test]
    fn rejects_a_set_without_an_equals_sign() {
        let err = parse_line(&["cgtether", "-c", "cpu", "-p", "j", "-s", "broken", "--", "true"])
            .expect_err("parse must fail");
        assert!(err.to_string().contains("missing a '='"));
    }

    #[test]
    fn controllers_and_path_come_together() {
        assert!(parse_line(&["cgtether", "-c", "cpu", "--", "true"]).is_err());
        assert!(parse_line(&["cgtether", "-p", "scope/j", "--", "true"]).is_err());
    }

    #[test]
    fn rejects_an_absolute_or_empty_path() {
        assert!(parse_line(&["cgtether", "-c", "cpu", "-p", "/scope", "--", "true"]).is_err());
        assert!(parse_line(&["cgtether", "-c", "cpu", "-p", "", "--", "true"]).is_err());
    }

    #[test]
    fn rejects_a_repeated_path() {
        assert!(
            parse_line(&["cgtether", "-c", "cpu", "-p", "a", "-p", "b", "--", "true"]).is_err()
        );
    }

    #[test]
    fn refuses_uid_and_gid_zero() {
        let err =
            parse_line(&["cgtether", "--uid", "0", "--", "true"]).expect_err("uid 0 must fail");
        assert!(err.to_string().contains("uid 0 is not allowed"));

        let err =
            parse_line(&["cgtether", "--gid", "0", "--", "true"]).expect_err("gid 0 must fail");
        assert!(err.to_string().contains("gid 0 is not allowed"));
    }

    #[test]
    fn accepts_numeric_ids() {
        let config =
            parse_line(&["cgtether", "-u", "1000", "-g", "100", "--", "true"]).expect("parse");
        assert_eq!(config.uid, Some(Uid::from_raw(1000)));
        assert_eq!(config.gid, Some(Gid::from_raw(100)));
    }

    #[test]
    fn rejects_an_unknown_user_name() {
        assert!(
            parse_line(&["cgtether", "-u", "no-such-user-cgtether", "--", "true"]).is_err()
        );
    }

    #[test]
    fn bounds_the_sigkill_delay() {
        let config = parse_line(&["cgtether", "-k", "250000", "--", "true"]).expect("parse");
        assert_eq!(config.grace, Duration::from_micros(250_000));

        let config = parse_line(&["cgtether", "-k", "0", "--", "true"]).expect("parse");
        assert_eq!(config.grace, Duration::from_micros(0));

        assert!(parse_line(&["cgtether", "-k", "1000001", "--", "true"]).is_err());
        assert!(parse_line(&["cgtether", "-k", "-1", "--", "true"]).is_err());
        assert!(parse_line(&["cgtether", "-k", "soon", "--", "true"]).is_err());
    }

    #[test]
    fn requires_a_program_after_the_separator() {
        assert!(parse_line(&["cgtether"]).is_err());
        assert!(parse_line(&["cgtether", "--"]).is_err());
    }

    #[test]
    fn program_arguments_may_look_like_flags() {
        let config =
            parse_line(&["cgtether", "--", "/bin/sh", "-c", "exit 3"]).expect("parse");
        assert_eq!(config.args, vec!["/bin/sh", "-c", "exit 3"]);
    }

    #[test]
    fn set_spellings_after_the_separator_are_not_flags() {
        let config = parse_line(&["cgtether", "--", "/bin/echo", "-s", "--set=x"]).expect("parse");
        assert_eq!(config.args, vec!["/bin/echo", "-s", "--set=x"]);
        assert!(config.controllers.is_empty());
    }

    #[test]
    fn help_is_reported_as_help() {
        let args: Vec<String> = vec!["cgtether".into(), "--help".into()];
        match parse(&args).expect("parse") {
            Parsed::Help => {}
            other => panic!("expected help, got {:?}", other),
        }
    }

    quickcheck! {
        fn setting_splits_on_the_first_equals(key: String, value: String) -> TestResult {
            if key.is_empty() || key.contains('=') || key.starts_with('-') {
                return TestResult::discard();
            }

            let joined = format!("{}={}", key, value);
            match split_setting(&joined) {
                Ok((parsed_key, parsed_value)) => {
                    TestResult::from_bool(parsed_key == key && parsed_value == value)
                }
                Err(_) => TestResult::failed(),
            }
        }
    }
}
