//! The `imgbuild` tool creates disk images and archives from a layout
//! description.

use imgbuild::config::parse_layout;
use imgbuild::state::BuildState;
use std::env;
use std::fmt;
use std::fs;
use std::process::exit;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// The name of the current program used in command line.
    prog: String,
    /// The path to the layout description file.
    layout_path: Option<String>,
    /// The path of the image file to create.
    output_path: Option<String>,
    /// If true, print command line help.
    help: bool,
    /// If true, print the version and exit.
    version: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args: Args = Default::default();
    let mut iter = env::args();

    args.prog = iter.next().unwrap_or("imgbuild".to_owned());

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => args.help = true,
            "-V" | "--version" => args.version = true,

            "-l" | "--layout" => {
                args.layout_path =
                    Some(iter.next().ok_or("missing argument for `--layout`")?);
            }
            "-O" | "--output" => {
                args.output_path =
                    Some(iter.next().ok_or("missing argument for `--output`")?);
            }

            _ => return Err(format!("unknown extra argument `{}`", arg)),
        }
    }

    Ok(args)
}

fn print_help(prog: &str) {
    println!("Usage: {} [OPTIONS...]", prog);
    println!();
    println!("Mandatory options:");
    println!();
    println!("  --layout, -l <file>  A file describing the disk image layout.");
    println!("  --output, -O <file>  The name of the output file to generate.");
    println!();
}

/// Writes an error to stderr, then exits.
fn error<M: fmt::Display>(prog: &str, msg: M) -> ! {
    eprintln!("{}: error: {}", prog, msg);
    eprintln!("Try `{} --help' for more information.", prog);
    exit(1);
}

fn main() {
    let args = parse_args().unwrap_or_else(|msg| {
        error("imgbuild", msg);
    });

    if args.help {
        print_help(&args.prog);
        exit(0);
    }

    if args.version {
        println!("imgbuild {}", VERSION);
        exit(0);
    }

    let Some(layout_path) = args.layout_path else {
        error(&args.prog, "no layout file specified");
    };
    let Some(output_path) = args.output_path else {
        error(&args.prog, "no output file specified");
    };

    let layout = fs::read_to_string(&layout_path).unwrap_or_else(|err| {
        error(&args.prog, format!("{}: {}", layout_path, err));
    });

    let mut state = BuildState::new(&output_path).unwrap_or_else(|err| {
        error(&args.prog, err);
    });

    if let Err(err) = parse_layout(&layout, &mut state) {
        // a failed build leaves no partial output behind
        let _ = fs::remove_file(&output_path);
        error(&args.prog, format!("{}: {}", layout_path, err));
    }

    if let Err(err) = state.process() {
        let _ = fs::remove_file(&output_path);
        error(&args.prog, err);
    }
}
