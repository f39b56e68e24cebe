use std::cmp::Ordering;
use std::fs;
use std::io::{self, prelude::*};
use std::mem;
use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use spillsort::{SpillSorter, SpillSorterBuilder};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let order: Order = arg_parser.value_of_t_or_exit("sort");
    let workdir: Option<&str> = arg_parser.value_of("workdir");
    let batch_size: usize = arg_parser.value_of_t_or_exit("batch_size");
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));

    let io_buf = arg_parser.value_of("io_buf").expect("value is defaulted");
    let io_buf_records = (io_buf.parse::<ByteSize>().expect("value is pre-validated").as_u64() as usize
        / mem::size_of::<u64>())
    .max(1);

    let input = arg_parser.value_of("input").expect("value is required");
    let mut input_stream = match fs::File::open(input) {
        Ok(file) => io::BufReader::new(file),
        Err(err) => {
            log::error!("input file opening error: {}", err);
            process::exit(1);
        }
    };

    let output = arg_parser.value_of("output").expect("value is required");
    let mut output_stream = match fs::File::create(output) {
        Ok(file) => io::BufWriter::new(file),
        Err(err) => {
            log::error!("output file creation error: {}", err);
            process::exit(1);
        }
    };

    let mut sorter_builder = SpillSorterBuilder::new().with_io_buf_records(io_buf_records);
    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_threads(threads);
    }

    if let Some(workdir) = workdir {
        sorter_builder = sorter_builder.with_workdir(path::Path::new(workdir));
    }

    let compare: fn(&u64, &u64) -> Ordering = match order {
        Order::Asc => |a, b| a.cmp(b),
        Order::Desc => |a, b| b.cmp(a),
    };
    let sorter: SpillSorter<u64, _> = match sorter_builder.build_with(compare) {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    let mut batch = vec![0u64; batch_size];
    loop {
        let records = match read_batch(&mut input_stream, &mut batch) {
            Ok(0) => break,
            Ok(records) => records,
            Err(err) => {
                log::error!("input file reading error: {}", err);
                process::exit(1);
            }
        };
        sorter.push(&batch[..records]);
    }

    let sorted = match sorter.finish() {
        Ok(sorted) => sorted,
        Err(err) => {
            log::error!("data sorting error: {}", err);
            process::exit(1);
        }
    };

    let mut write_error: Option<io::Error> = None;
    let streamed = sorted.execute(|record| {
        if write_error.is_none() {
            if let Err(err) = output_stream.write_all(bytemuck::bytes_of(record)) {
                write_error = Some(err);
            }
        }
    });
    if let Err(err) = streamed {
        log::error!("sorted stream error: {}", err);
        process::exit(1);
    }
    if let Some(err) = write_error {
        log::error!("data saving error: {}", err);
        process::exit(1);
    }

    if let Err(err) = output_stream.flush() {
        log::error!("data flushing error: {}", err);
        process::exit(1);
    }
}

/// Reads up to one batch of raw records, truncating a trailing partial record.
fn read_batch(reader: &mut impl Read, batch: &mut [u64]) -> io::Result<usize> {
    let bytes: &mut [u8] = bytemuck::cast_slice_mut(batch);
    let mut filled = 0;
    while filled < bytes.len() {
        match reader.read(&mut bytes[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }

    return Ok(filled / mem::size_of::<u64>());
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
enum Order {
    Asc,
    Desc,
}

impl Order {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Order::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Order {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Order as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("spillsort")
        .about("concurrent external sorter for raw binary u64 records")
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
            clap::Arg::new("sort")
                .short('s')
                .long("sort")
                .help("sorting order")
                .takes_value(true)
                .default_value("asc")
                .possible_values(Order::possible_values()),
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
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of producer threads to size the engine for")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("workdir")
                .short('d')
                .long("workdir")
                .help("directory to be used to store run files")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("batch_size")
                .short('b')
                .long("batch-size")
                .help("records per pushed batch")
                .takes_value(true)
                .default_value("262144")
                .validator(|v| match v.parse::<usize>() {
                    Ok(0) | Err(_) => Err("batch size must be a positive integer".to_string()),
                    Ok(_) => Ok(()),
                }),
        )
        .arg(
            clap::Arg::new("io_buf")
                .long("io-buf")
                .help("run file read/write buffer size")
                .takes_value(true)
                .default_value("4MB")
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("buffer size format incorrect: {}", err)),
                }),
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
