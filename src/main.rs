use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use u32_ext_sort::{ExternalSorterBuilder, MergeStrategy, SortError, TrailingBytes};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let input = arg_parser.value_of("input").expect("value is required");
    let output = arg_parser.value_of("output").expect("value is required");
    let memory = arg_parser.value_of("memory").expect("value has default");
    let tmp_dir: Option<&str> = arg_parser.value_of("tmp_dir");
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));
    let trailing: Trailing = arg_parser.value_of_t_or_exit("trailing");
    let merge: Merge = arg_parser.value_of_t_or_exit("merge");

    let mut sorter_builder = ExternalSorterBuilder::new()
        .with_memory_budget(memory.parse::<ByteSize>().expect("value is pre-validated").as_u64())
        .with_trailing_bytes(match trailing {
            Trailing::Reject => TrailingBytes::Reject,
            Trailing::Truncate => TrailingBytes::Truncate,
        })
        .with_merge_strategy(match merge {
            Merge::Pairwise => MergeStrategy::Pairwise,
            Merge::Heap => MergeStrategy::Heap,
        });

    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }

    if let Some(tmp_dir) = tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }

    let sorter = match sorter_builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(exit_code(&err));
        }
    };

    match sorter.sort(path::Path::new(input), path::Path::new(output)) {
        Ok(stats) => {
            println!(
                "Finished: {} records sorted in {} rounds into {}",
                stats.records, stats.rounds, output
            );
        }
        Err(err) => {
            log::error!("data sorting error: {}", err);
            process::exit(exit_code(&err));
        }
    }
}

fn exit_code(err: &SortError) -> i32 {
    match err {
        SortError::Config(_) => 2,
        SortError::IO { .. } | SortError::TempDir(_) => 3,
        SortError::MalformedInput { .. } => 4,
        SortError::DiskSpace { .. } => 5,
        SortError::Cancelled => 130,
        SortError::ThreadPoolBuildError(_) => 1,
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Trailing {
    Reject,
    Truncate,
}

impl Trailing {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Trailing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Trailing as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Merge {
    Pairwise,
    Heap,
}

impl Merge {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Merge {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Merge as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("u32-ext-sort")
        .about("external sorter of binary files of 4-byte unsigned integers")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("memory")
                .short('m')
                .long("memory")
                .help("memory budget shared by the chunks of a round")
                .takes_value(true)
                .default_value("10MiB")
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Memory budget format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel sorting, defaults to the number of CPUs")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("trailing")
                .long("trailing")
                .help("what to do with an input ending with a partial record")
                .takes_value(true)
                .default_value("reject")
                .possible_values(Trailing::possible_values()),
        )
        .arg(
            clap::Arg::new("merge")
                .long("merge")
                .help("spills merge strategy")
                .takes_value(true)
                .default_value("pairwise")
                .possible_values(Merge::possible_values()),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
