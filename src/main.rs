//! Command-line front-end: extract MiGo types from SSA source files.

use clap::{App, Arg, SubCommand};
use log::LevelFilter;
use migo_extract::infer::MigoExtract;
use migo_extract::ssabuild::Config;
use std::fs::File;
use std::io::Write;
use std::process::exit;

fn main() {
    let matches = App::new("migo-extract")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Static extraction of MiGo behavioural types from SSA programs")
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .global(true)
                .help("Increase logging verbosity (-v debug, -vv trace)"),
        )
        .arg(
            Arg::with_name("quiet")
                .short("q")
                .global(true)
                .help("Log errors only"),
        )
        .subcommand(
            SubCommand::with_name("migo")
                .about("Extract MiGo types from source files of a single main package")
                .arg(
                    Arg::with_name("FILES")
                        .help("SSA source files of the main package")
                        .required(true)
                        .multiple(true),
                )
                .arg(
                    Arg::with_name("output")
                        .long("output")
                        .takes_value(true)
                        .help("Output file (default stdout)"),
                ),
        )
        .get_matches();

    let level = if matches.is_present("quiet") {
        LevelFilter::Error
    } else {
        match matches.occurrences_of("verbose") {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    simple_logger::SimpleLogger::new().with_level(level).init().unwrap();

    match matches.subcommand() {
        ("migo", Some(sub)) => {
            let files: Vec<&str> = sub.values_of("FILES").unwrap().collect();
            let outfile = sub.value_of("output");
            exit(extract_migo(&files, outfile));
        }
        _ => {
            eprintln!("{}", matches.usage());
            exit(2);
        }
    }
}

fn extract_migo(files: &[&str], outfile: Option<&str>) -> i32 {
    let config = match Config::new(files) {
        Ok(c) => c,
        Err(err) => {
            log::error!("{}", err);
            return 1;
        }
    };
    let prog = match config.build() {
        Ok(p) => p,
        Err(err) => {
            log::error!("{}", err);
            return 1;
        }
    };
    let mut extract = MigoExtract::new(prog);
    if let Err(err) = extract.run() {
        log::error!("{}", err);
        return 1;
    }
    extract.migo_mut().cleanup();
    let rendered = extract.migo().to_string();
    match outfile {
        Some(path) => {
            let written = File::create(path).and_then(|mut f| f.write_all(rendered.as_bytes()));
            if let Err(err) = written {
                log::error!("{}: {}", path, err);
                return 1;
            }
        }
        None => print!("{}", rendered),
    }
    0
}
