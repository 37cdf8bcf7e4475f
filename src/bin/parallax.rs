use std::io::Read as _;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use clap::Parser;
use colored::Colorize as _;
use parallax::{call, copy, hosts, slurp, HostResults, LevelFilter, Options};

#[derive(Parser)]
#[clap(
    name = "parallax",
    about = "Run commands or copy files on many hosts in parallel over SSH"
)]
struct Args {
    #[clap(
        short = 'f',
        long = "hosts",
        help = "Host file, one [user@]host[:port] per line (repeatable)"
    )]
    hosts: Vec<PathBuf>,
    #[clap(
        short = 'H',
        long = "host",
        help = "Whitespace-separated [user@]host[:port] entries (repeatable)"
    )]
    host: Vec<String>,
    #[clap(short = 'l', long, help = "Default login user")]
    user: Option<String>,
    #[clap(short = 'p', long, default_value = "32", help = "Max parallel connections")]
    par: usize,
    #[clap(
        short = 't',
        long,
        default_value = "0",
        help = "Per-task timeout in seconds, 0 disables"
    )]
    timeout: u64,
    #[clap(short = 'o', long, help = "Write per-host stdout files into this directory")]
    outdir: Option<PathBuf>,
    #[clap(short = 'e', long, help = "Write per-host stderr files into this directory")]
    errdir: Option<PathBuf>,
    #[clap(short = 'A', long, help = "Prompt for a password and supply it to ssh")]
    askpass: bool,
    #[clap(short = 'O', long = "option", help = "Extra ssh -o option (repeatable)")]
    option: Vec<String>,
    #[clap(short = 'x', long, help = "Extra ssh/scp arguments (shell-quoted)")]
    extra_args: Option<String>,
    #[clap(short = 'i', long, help = "Print aggregated output per host")]
    inline: bool,
    #[clap(short = 'P', long = "print", help = "Print output as it arrives")]
    print_out: bool,
    #[clap(short = 'q', long, help = "Silence progress output")]
    quiet: bool,
    #[clap(short = 'v', long, help = "Verbose diagnostics")]
    verbose: bool,
    #[clap(long, help = "Read standard input and feed it to each task")]
    send_input: bool,
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser)]
enum SubCommand {
    #[clap(name = "call", about = "Run a command on all hosts")]
    Call {
        #[clap(help = "Command line to execute remotely")]
        command: String,
    },
    #[clap(name = "copy", about = "Copy a local path to all hosts")]
    Copy {
        src: String,
        dst: String,
        #[clap(short, long, help = "Copy recursively")]
        recursive: bool,
    },
    #[clap(name = "slurp", about = "Fetch a remote path from all hosts")]
    Slurp {
        src: String,
        #[clap(help = "Relative local destination (stored under <localdir>/<host>/)")]
        dst: String,
        #[clap(short, long, help = "Copy recursively")]
        recursive: bool,
        #[clap(short = 'L', long, help = "Local base directory for downloads")]
        localdir: Option<PathBuf>,
    },
}

fn main() {
    let args = Args::parse();
    parallax::configure_logger(if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    });
    match run(args) {
        Ok(true) => {}
        Ok(false) => exit(1),
        Err(e) => {
            eprintln!("{}", e.to_string().red().bold());
            exit(1);
        }
    }
}

fn run(args: Args) -> parallax::Result<bool> {
    let mut targets = hosts::read_host_files(&args.hosts, args.user.as_deref())?;
    for entry in &args.host {
        targets.extend(hosts::parse_host_string(entry, args.user.as_deref()));
    }
    if targets.is_empty() {
        return Err(parallax::Error::invalid_data(
            "no hosts given, use --hosts or --host",
        ));
    }

    let input_stream = if args.send_input {
        let mut input = Vec::new();
        std::io::stdin().read_to_end(&mut input)?;
        Some(input)
    } else {
        None
    };
    let ssh_extra = match &args.extra_args {
        Some(extra) => shlex::split(extra)
            .ok_or_else(|| parallax::Error::invalid_data("unbalanced quotes in --extra-args"))?,
        None => Vec::new(),
    };
    let mut opts = Options {
        limit: args.par,
        timeout: Duration::from_secs(args.timeout),
        askpass: args.askpass,
        outdir: args.outdir.clone(),
        errdir: args.errdir.clone(),
        ssh_options: args.option.clone(),
        ssh_extra,
        verbose: args.verbose,
        quiet: args.quiet,
        print_out: args.print_out,
        inline: args.inline,
        input_stream,
        default_user: args.user.clone(),
        ..Options::default()
    };

    let results = match &args.subcmd {
        SubCommand::Call { command } => call(targets, command, &opts)?,
        SubCommand::Copy {
            src,
            dst,
            recursive,
        } => {
            opts.recursive = *recursive;
            copy(targets, src, dst, &opts)?
        }
        SubCommand::Slurp {
            src,
            dst,
            recursive,
            localdir,
        } => {
            opts.recursive = *recursive;
            opts.localdir = localdir.clone();
            slurp(targets, src, dst, &opts)?
        }
    };
    Ok(report(&results, args.quiet))
}

/// Prints one summary line per host; returns true when every host succeeded
fn report(results: &HostResults, quiet: bool) -> bool {
    let mut hosts: Vec<&String> = results.keys().collect();
    hosts.sort();
    let mut ok = true;
    for host in hosts {
        match &results[host] {
            Ok(output) => {
                if !quiet {
                    println!("{} {}", "[OK]".green().bold(), host);
                }
                if !output.stdout.is_empty() {
                    print!("{}", String::from_utf8_lossy(&output.stdout));
                }
            }
            Err(err) => {
                ok = false;
                eprintln!("{} {} {}", "[FAIL]".red().bold(), host, err);
            }
        }
    }
    ok
}
