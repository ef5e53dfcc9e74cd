use std::process;

use fitsio_tiled::checksum::ChecksumStatus;
use fitsio_tiled::header::format_card;
use fitsio_tiled::{Error, Fits, Hdu, HduKind, Header};

const USAGE: &str = "\
Usage: fitsinfo [-v] <file.fits>

Print a summary of every unit in a FITS file.
  -v, --verbose   also print the header cards";

fn dims(header: &Header, prefix: &str) -> Vec<usize> {
    let naxis = header.get_int(prefix).unwrap_or(0).max(0) as usize;
    (1..=naxis)
        .map(|i| header.get_int(&format!("{prefix}{i}")).unwrap_or(0).max(0) as usize)
        .collect()
}

fn checksum_label(hdu: &Hdu) -> String {
    match hdu.verify_checksum() {
        Ok(ChecksumStatus::Valid) => "valid".to_string(),
        Ok(ChecksumStatus::DataMismatch) => "DATASUM mismatch".to_string(),
        Ok(ChecksumStatus::HeaderMismatch) => "CHECKSUM mismatch".to_string(),
        Err(Error::MissingChecksum(_)) => "absent".to_string(),
        Err(e) => format!("unreadable ({e})"),
    }
}

fn format_hdu(index: usize, hdu: &Hdu) -> String {
    let h = hdu.header();
    let mut out = String::new();
    let label = match h.get_str("EXTNAME") {
        Some(name) => format!(" (EXTNAME: {})", name.trim()),
        None => String::new(),
    };
    let kind = if hdu.is_compressed_image() {
        "compressed IMAGE"
    } else if hdu.is_compressed_table() {
        "compressed BINTABLE"
    } else {
        match hdu.kind() {
            HduKind::Primary => "Primary",
            HduKind::Image => "IMAGE extension",
            HduKind::BinaryTable => "BINTABLE extension",
            HduKind::Other => "extension",
        }
    };
    out.push_str(&format!("HDU {index}: {kind}{label}\n"));

    if hdu.is_compressed_image() {
        out.push_str(&format!("  Algorithm: {}\n", h.get_str("ZCMPTYPE").unwrap_or("?")));
        out.push_str(&format!("  ZBITPIX: {}\n", h.get_int("ZBITPIX").unwrap_or(0)));
        out.push_str(&format!("  Dimensions: {:?}\n", dims(h, "ZNAXIS")));
        out.push_str(&format!("  Tiles: {}\n", h.get_int("NAXIS2").unwrap_or(0)));
        if let Some(q) = h.get_str("ZQUANTIZ") {
            out.push_str(&format!("  Quantization: {q}\n"));
        }
    } else if hdu.is_compressed_table() {
        out.push_str(&format!("  Rows: {}\n", h.get_int("ZNAXIS2").unwrap_or(0)));
        out.push_str(&format!("  Rows per tile: {}\n", h.get_int("ZTILELEN").unwrap_or(0)));
        out.push_str(&format!("  Columns: {}\n", h.get_int("TFIELDS").unwrap_or(0)));
    } else {
        match hdu.kind() {
            HduKind::BinaryTable => {
                out.push_str(&format!("  Columns: {}\n", h.get_int("TFIELDS").unwrap_or(0)));
                out.push_str(&format!("  Rows: {}\n", h.get_int("NAXIS2").unwrap_or(0)));
                out.push_str(&format!("  Row width: {} bytes\n", h.get_int("NAXIS1").unwrap_or(0)));
            }
            _ => {
                out.push_str(&format!("  BITPIX: {}\n", h.get_int("BITPIX").unwrap_or(0)));
                let naxes = dims(h, "NAXIS");
                out.push_str(&format!("  NAXIS: {}\n", naxes.len()));
                if !naxes.is_empty() {
                    out.push_str(&format!("  Dimensions: {naxes:?}\n"));
                }
            }
        }
    }
    out.push_str(&format!("  Data size: {} bytes\n", hdu.data().len()));
    out.push_str(&format!("  Checksum: {}\n", checksum_label(hdu)));
    out
}

fn format_cards(header: &Header) -> Result<String, String> {
    let mut out = String::from("  Header cards:\n");
    for card in header.iter() {
        let image = format_card(card).map_err(|e| format!("Error formatting {}: {e}", card.keyword))?;
        out.push_str(&format!("    {}\n", String::from_utf8_lossy(&image).trim_end()));
    }
    Ok(out)
}

fn format_fits_info(fits: &Fits, verbose: bool) -> Result<String, String> {
    let mut out = String::new();
    for (i, hdu) in fits.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&format_hdu(i, hdu));
        if verbose {
            out.push_str(&format_cards(hdu.header())?);
        }
    }
    Ok(out)
}

fn run(args: &[String]) -> Result<String, String> {
    let mut verbose = false;
    let mut file_path = None;

    for arg in args {
        if arg == "-v" || arg == "--verbose" {
            verbose = true;
        } else if arg.starts_with('-') {
            return Err(format!("Unknown option: {arg}"));
        } else {
            if file_path.is_some() {
                return Err("Too many arguments".to_string());
            }
            file_path = Some(arg.as_str());
        }
    }

    let path = file_path.ok_or_else(|| USAGE.to_string())?;
    let fits = Fits::open(path).map_err(|e| format!("Error reading '{path}': {e}"))?;
    format_fits_info(&fits, verbose)
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args) {
        Ok(output) => print!("{output}"),
        Err(msg) => {
            eprintln!("{msg}");
            process::exit(1);
        }
    }
}
