//! Argv construction for the `ssh`/`scp` child processes.

use std::path::Path;

use crate::hosts::HostSpec;
use crate::Options;

/// `user@host:path` (or `host:path`) form used by scp
fn scp_target(host: &HostSpec, path: &str) -> String {
    match host.user() {
        Some(user) => format!("{}@{}:{}", user, host.host(), path),
        None => format!("{}:{}", host.host(), path),
    }
}

/// Builds the `ssh` argv for running `cmdline` on `host`
pub(crate) fn build_call(host: &HostSpec, cmdline: &str, opts: &Options) -> Vec<String> {
    let mut cmd = vec![
        "ssh".to_owned(),
        host.host().to_owned(),
        "-o".to_owned(),
        "NumberOfPasswordPrompts=1".to_owned(),
        "-o".to_owned(),
        "SendEnv=PARALLAX_NODENUM PARALLAX_HOST".to_owned(),
    ];
    for opt in &opts.ssh_options {
        cmd.push("-o".to_owned());
        cmd.push(opt.clone());
    }
    if let Some(user) = host.user() {
        cmd.push("-l".to_owned());
        cmd.push(user.to_owned());
    }
    if let Some(port) = host.port() {
        cmd.push("-p".to_owned());
        cmd.push(port.to_string());
    }
    cmd.extend(opts.ssh_extra.iter().cloned());
    if !cmdline.is_empty() {
        cmd.push(cmdline.to_owned());
    }
    cmd
}

/// Common `scp -qC` prefix with options, port and recursion flags
fn scp_base(host: &HostSpec, opts: &Options) -> Vec<String> {
    let mut cmd = vec!["scp".to_owned(), "-qC".to_owned()];
    for opt in &opts.ssh_options {
        cmd.push("-o".to_owned());
        cmd.push(opt.clone());
    }
    if let Some(port) = host.port() {
        cmd.push("-P".to_owned());
        cmd.push(port.to_string());
    }
    if opts.recursive {
        cmd.push("-r".to_owned());
    }
    cmd.extend(opts.ssh_extra.iter().cloned());
    cmd
}

/// Builds the `scp` argv for uploading `src` to `dst` on `host`
pub(crate) fn build_copy(host: &HostSpec, src: &str, dst: &str, opts: &Options) -> Vec<String> {
    let mut cmd = scp_base(host, opts);
    cmd.push(src.to_owned());
    cmd.push(scp_target(host, dst));
    cmd
}

/// Builds the `scp` argv for downloading `src` from `host` to `localpath`
pub(crate) fn build_slurp(
    host: &HostSpec,
    src: &str,
    localpath: &Path,
    opts: &Options,
) -> Vec<String> {
    let mut cmd = scp_base(host, opts);
    cmd.push(scp_target(host, src));
    cmd.push(localpath.display().to_string());
    cmd
}

#[cfg(test)]
mod test {
    use super::*;

    fn opts() -> Options {
        Options {
            ssh_options: vec!["StrictHostKeyChecking=no".to_owned()],
            ssh_extra: vec!["-vv".to_owned()],
            ..Options::default()
        }
    }

    #[test]
    fn test_call_argv() {
        let host = HostSpec::new("node1").with_port(2022).with_user("admin");
        let cmd = build_call(&host, "uptime", &opts());
        insta::assert_snapshot!(cmd.join(" "), @"ssh node1 -o NumberOfPasswordPrompts=1 -o SendEnv=PARALLAX_NODENUM PARALLAX_HOST -o StrictHostKeyChecking=no -l admin -p 2022 -vv uptime");
    }

    #[test]
    fn test_call_argv_minimal() {
        let cmd = build_call(&HostSpec::new("node1"), "uptime", &Options::default());
        insta::assert_snapshot!(cmd.join(" "), @"ssh node1 -o NumberOfPasswordPrompts=1 -o SendEnv=PARALLAX_NODENUM PARALLAX_HOST uptime");
    }

    #[test]
    fn test_copy_argv() {
        let host = HostSpec::new("node1").with_port(2022).with_user("admin");
        let cmd = build_copy(&host, "app.conf", "/etc/app.conf", &opts());
        insta::assert_snapshot!(cmd.join(" "), @"scp -qC -o StrictHostKeyChecking=no -P 2022 -r -vv app.conf admin@node1:/etc/app.conf");
    }

    #[test]
    fn test_slurp_argv() {
        let mut options = opts();
        options.recursive = false;
        let cmd = build_slurp(
            &HostSpec::new("node1"),
            "/var/log/syslog",
            Path::new("logs/node1/syslog"),
            &options,
        );
        insta::assert_snapshot!(cmd.join(" "), @"scp -qC -o StrictHostKeyChecking=no -vv node1:/var/log/syslog logs/node1/syslog");
    }
}
