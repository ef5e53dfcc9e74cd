use std::process;

use fitsio_tiled::checksum::ChecksumStatus;
use fitsio_tiled::compress::quantize::DitherMethod;
use fitsio_tiled::{Algorithm, AlgorithmOptions, CompressionOptions, Error, Fits, TableCompressionOptions};
use tracing::info;

const USAGE: &str = "\
Usage: fitszip [-v] <subcommand> [options] <input.fits> [<output.fits>]

Subcommands:
  compress <input.fits> <output.fits>
      Tile-compress every image (and binary tables with --tables).
        --algo NAME        RICE_1, HCOMPRESS_1, PLIO_1, GZIP_1, GZIP_2, NOCOMPRESS
        --tile N[,N...]    tile extents, first axis first
        --quantize Q|none  quantize level for floating point images
        --dither METHOD    NO_DITHER, SUBTRACTIVE_DITHER_1, SUBTRACTIVE_DITHER_2
        --seed N           first dither seed (ZDITHER0)
        --scale S          H-compress scale
        --tables           compress binary tables too
        --rows N           rows per table tile
        --checksum         stamp CHECKSUM/DATASUM on the output

  decompress <input.fits> <output.fits> [--checksum]
      Restore every compressed image and table.

  checksum <input.fits> [<output.fits>]
      Stamp CHECKSUM/DATASUM on every unit (in place without an output).

  verify <input.fits>
      Check CHECKSUM/DATASUM of every unit.";

/// Everything taken from the command line.
#[derive(Debug, Default)]
struct Command {
    name: String,
    paths: Vec<String>,
    algorithm: Option<Algorithm>,
    tile: Option<Vec<usize>>,
    quantize: Option<Option<f64>>,
    dither: Option<DitherMethod>,
    seed: Option<i64>,
    scale: Option<f64>,
    tables: bool,
    rows: Option<usize>,
    checksum: bool,
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("Invalid value for {flag}: {value}"))
}

fn parse_args(args: &[String]) -> Result<(Command, bool), String> {
    let mut verbose = false;
    let mut cmd = Command::default();
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        let mut value = |flag: &str| {
            it.next()
                .map(String::as_str)
                .ok_or_else(|| format!("Missing value for {flag}"))
        };
        match arg.as_str() {
            "-v" | "--verbose" => verbose = true,
            "--algo" => {
                let name = value(arg)?;
                cmd.algorithm = Some(Algorithm::from_name(name).map_err(|e| e.to_string())?);
            }
            "--tile" => {
                let text = value(arg)?;
                let tile = text
                    .split(',')
                    .map(|n| parse_number::<usize>(arg, n))
                    .collect::<Result<Vec<_>, _>>()?;
                cmd.tile = Some(tile);
            }
            "--quantize" => {
                let text = value(arg)?;
                cmd.quantize = Some(if text.eq_ignore_ascii_case("none") {
                    None
                } else {
                    Some(parse_number(arg, text)?)
                });
            }
            "--dither" => {
                let name = value(arg)?;
                cmd.dither = Some(DitherMethod::from_name(name).map_err(|e| e.to_string())?);
            }
            "--seed" => cmd.seed = Some(parse_number(arg, value(arg)?)?),
            "--scale" => cmd.scale = Some(parse_number(arg, value(arg)?)?),
            "--rows" => cmd.rows = Some(parse_number(arg, value(arg)?)?),
            "--tables" => cmd.tables = true,
            "--checksum" => cmd.checksum = true,
            other if other.starts_with('-') => return Err(format!("Unknown option: {other}")),
            other if cmd.name.is_empty() => cmd.name = other.to_string(),
            other => cmd.paths.push(other.to_string()),
        }
    }
    if cmd.name.is_empty() {
        return Err(USAGE.to_string());
    }
    Ok((cmd, verbose))
}

fn compression_options(cmd: &Command) -> CompressionOptions {
    let mut options = CompressionOptions::new(cmd.algorithm.unwrap_or(Algorithm::Rice));
    if let Some(tile) = &cmd.tile {
        options = options.with_tile_shape(tile);
    }
    if let Some(level) = cmd.quantize {
        options = options.with_quantize_level(level);
    }
    if cmd.dither.is_some() || cmd.seed.is_some() {
        let method = cmd.dither.unwrap_or(options.dither);
        let seed = cmd.seed.unwrap_or(options.dither_seed);
        options = options.with_dither(method, seed);
    }
    if let Some(scale) = cmd.scale {
        options = options.with_algorithm_options(AlgorithmOptions::default().with_scale(scale));
    }
    if cmd.tables || cmd.rows.is_some() {
        let mut tables = TableCompressionOptions::default();
        if let Some(rows) = cmd.rows {
            tables = tables.with_rows_per_tile(rows);
        }
        options = options.with_tables(tables);
    }
    options
}

fn input_output(cmd: &Command, output_required: bool) -> Result<(&str, Option<&str>), String> {
    match cmd.paths.as_slice() {
        [input] if !output_required => Ok((input.as_str(), None)),
        [input, output] => Ok((input.as_str(), Some(output.as_str()))),
        [] | [_] => Err(format!("{}: missing file argument\n\n{USAGE}", cmd.name)),
        _ => Err("Too many arguments".to_string()),
    }
}

fn open(path: &str) -> Result<Fits, String> {
    Fits::open(path).map_err(|e| format!("Error reading '{path}': {e}"))
}

fn write(mut fits: Fits, path: &str, checksum: bool) -> Result<(), String> {
    if checksum {
        fits.set_checksum().map_err(|e| e.to_string())?;
    }
    fits.write_file(path)
        .map_err(|e| format!("Error writing '{path}': {e}"))
}

fn verify(fits: &Fits) -> Result<String, String> {
    let mut out = String::new();
    let mut bad = false;
    for (i, hdu) in fits.iter().enumerate() {
        let status = match hdu.verify_checksum() {
            Ok(ChecksumStatus::Valid) => "valid",
            Ok(ChecksumStatus::DataMismatch) => {
                bad = true;
                "DATASUM mismatch"
            }
            Ok(ChecksumStatus::HeaderMismatch) => {
                bad = true;
                "CHECKSUM mismatch"
            }
            Err(Error::MissingChecksum(_)) => "absent",
            Err(e) => return Err(format!("HDU {i}: {e}")),
        };
        out.push_str(&format!("HDU {i}: {status}\n"));
    }
    if bad {
        Err(out)
    } else {
        Ok(out)
    }
}

fn run(args: &[String]) -> Result<String, String> {
    let (cmd, _) = parse_args(args)?;
    match cmd.name.as_str() {
        "compress" => {
            let (input, output) = input_output(&cmd, true)?;
            let output = output.unwrap_or(input);
            let options = compression_options(&cmd);
            let fits = open(input)?;
            let compressed = fits.compress(&options).map_err(|e| format!("Error compressing '{input}': {e}"))?;
            drop(fits);
            write(compressed, output, cmd.checksum)?;
            info!(input, output, "compressed");
            Ok(format!("{input} -> {output}\n"))
        }
        "decompress" => {
            let (input, output) = input_output(&cmd, true)?;
            let output = output.unwrap_or(input);
            let fits = open(input)?;
            let restored = fits.decompress().map_err(|e| format!("Error decompressing '{input}': {e}"))?;
            drop(fits);
            write(restored, output, cmd.checksum)?;
            info!(input, output, "decompressed");
            Ok(format!("{input} -> {output}\n"))
        }
        "checksum" => {
            let (input, output) = input_output(&cmd, false)?;
            let output = output.unwrap_or(input);
            let mut fits = open(input)?;
            for hdu in fits.units_mut() {
                hdu.realize().map_err(|e| e.to_string())?;
            }
            write(fits, output, true)?;
            Ok(format!("{output}: checksums stamped\n"))
        }
        "verify" => {
            let (input, _) = input_output(&cmd, false)?;
            verify(&open(input)?)
        }
        other => Err(format!("Unknown subcommand: {other}\n\n{USAGE}")),
    }
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let verbose = args.iter().any(|a| a == "-v" || a == "--verbose");
    tracing_subscriber::fmt()
        .with_max_level(if verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(&args) {
        Ok(output) => print!("{output}"),
        Err(msg) => {
            eprintln!("{msg}");
            process::exit(1);
        }
    }
}
