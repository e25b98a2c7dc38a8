use std::io::{self, BufRead, Write};
use std::process::Command;

use clap::Parser;
use memscan::{CancelFlag, Session, install_sigint};
use tracing::Level;

/// Memory Scanner
///
/// Attaches to a running process, finds the addresses holding a value of
/// interest by repeatedly scanning and narrowing, and can then read, watch
/// or modify them in place.
#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    /// PID of the process to attach to
    #[clap(short, long)]
    pid: Option<i32>,

    /// Set log level to debug
    #[clap(short, long)]
    debug: bool,
}

fn setup_tracing(debug: bool) -> Result<(), tracing::dispatcher::SetGlobalDefaultError> {
    // diagnostics go to stderr; stdout carries the formats front-ends parse
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(if debug { Level::DEBUG } else { Level::INFO })
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
}

const SHORT_HELP: &str = "\
pid        set or print the target process id
reset      drop all matches and re-read the target's regions
snapshot   save the current state of all scannable regions
list       list the current matches
delete     forget one match by id
dregion    delete regions by id, `!` inverts the selection
lregions   list the known regions
update     re-read the value of every match
set        write a value into matches: [ids=]value[/seconds]
watch      report changes to one match until interrupted
dump       hex dump target memory: addr len [file]
write      typed write: type addr value
option     change a setting: name value
shell      run a shell command
show       show version
exit       quit
\" <text>   scan for a string
=, !=, <, >, +, -   comparison scans, operand optional";

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_tracing(args.debug)?;

    let cancel = CancelFlag::new();
    install_sigint(&cancel);

    let mut session = Session::new(cancel);
    if let Some(pid) = args.pid {
        if let Err(e) = session.set_pid(pid) {
            eprintln!("error: {e}");
        }
    }

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("{}> ", session.num_matches());
        io::stdout().flush()?;

        let line = match lines.next() {
            Some(line) => line?,
            None => {
                // EOF behaves like exit
                println!("exit");
                break;
            }
        };
        if dispatch(&mut session, &line) {
            break;
        }
    }

    Ok(())
}

/// Tokenise one input line and route it to the session. Returns true when
/// the session should end.
fn dispatch(session: &mut Session, line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return false;
    }

    // a leading quote scans for the rest of the line as a string
    if let Some(text) = line.strip_prefix('"') {
        report(session.string_scan(text));
        return false;
    }

    let tokens: Vec<String> = line.split_whitespace().map(str::to_owned).collect();
    let cmd = tokens[0].as_str();
    let rest = &tokens[1..];

    match cmd {
        "pid" => match rest.first() {
            Some(arg) => match arg.parse::<i32>() {
                Ok(pid) if pid > 0 => report(session.set_pid(pid)),
                _ => eprintln!("error: `{arg}` does not look like a valid pid"),
            },
            None => session.report_pid(),
        },
        "reset" => report(session.reset()),
        "snapshot" => report(session.snapshot()),
        "list" => report(session.list()),
        "delete" => match rest.first() {
            Some(id) => report(session.delete(id)),
            None => eprintln!("error: was expecting one argument, see `help delete`"),
        },
        "dregion" => match rest.first() {
            Some(selector) => report(session.dregion(selector)),
            None => eprintln!("error: expected an argument, see `help dregion`"),
        },
        "lregions" => report(session.lregions()),
        "update" => report(session.update()),
        "set" => report(session.set(rest)),
        "watch" => match rest.first() {
            Some(id) => report(session.watch(id)),
            None => eprintln!("error: was expecting one argument, see `help watch`"),
        },
        "dump" => report(session.dump(rest)),
        "write" => report(session.write(rest)),
        "option" => match (rest.first(), rest.get(1), rest.len()) {
            (Some(name), Some(value), 2) => report(session.option(name, value)),
            _ => eprintln!("error: bad arguments, see `help option`"),
        },
        "shell" => {
            if rest.is_empty() {
                eprintln!("error: shell command requires an argument, see `help shell`");
            } else {
                let joined = rest.join(" ");
                match Command::new("sh").arg("-c").arg(&joined).status() {
                    Ok(_) => {}
                    Err(_) => eprintln!("error: command was not executed"),
                }
            }
        }
        "show" => match rest.first().map(String::as_str) {
            Some("version") => println!("memscan {}", env!("CARGO_PKG_VERSION")),
            Some(other) => eprintln!("error: unrecognized show command `{other}`"),
            None => eprintln!("error: expecting an argument"),
        },
        "help" => println!("{SHORT_HELP}"),
        "exit" | "quit" => return true,
        "=" | "!=" | "<" | ">" | "+" | "-" => {
            if rest.len() > 1 {
                eprintln!("error: too many values specified, see `help {cmd}`");
            } else {
                report(session.shorthand(cmd, rest.first().map(String::as_str)));
            }
        }
        _ => report(session.default_scan(&tokens)),
    }
    false
}

fn report(result: Result<(), memscan::CommandError>) {
    if let Err(e) = result {
        eprintln!("error: {e}");
    }
}
