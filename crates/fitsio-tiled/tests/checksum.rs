//! CHECKSUM/DATASUM against raw file bytes.

use fitsio_tiled::block::BLOCK_SIZE;
use fitsio_tiled::checksum::{self, ChecksumStatus};
use fitsio_tiled::{Algorithm, Array, CompressionOptions, Error, Fits, Hdu};

fn stamped() -> Fits {
    let mut fits = Fits::new();
    let mut hdu = Hdu::from_array(&Array::from_i32(&[40, 30], (0..1200).collect()).unwrap(), true).unwrap();
    hdu.header_mut().set("OBJECT", "M51");
    fits.push(hdu);
    let ext = Hdu::from_array(&Array::from_f64(&[10], (0..10).map(|i| i as f64 / 3.0).collect()).unwrap(), false).unwrap();
    fits.push(ext);
    fits.set_checksum().unwrap();
    fits
}

#[test]
fn known_encoding() {
    assert_eq!(checksum::encode(1234567890, false), "dCW2fBU0dBU0dBU0");
    assert_eq!(checksum::decode("dCW2fBU0dBU0dBU0", false).unwrap(), 1234567890);
}

#[test]
fn every_unit_sums_to_all_ones_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stamped.fits");
    stamped().write_file(&path).unwrap();
    let bytes = std::fs::read(&path).unwrap();

    // primary: one header block and 4800 bytes of data
    let primary_len = BLOCK_SIZE + 4800usize.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    assert_eq!(checksum::checksum(&bytes[..primary_len]), u32::MAX);
    assert_eq!(checksum::checksum(&bytes[primary_len..]), u32::MAX);

    let reopened = Fits::open(&path).unwrap();
    assert_eq!(
        reopened.verify_checksum().unwrap(),
        vec![ChecksumStatus::Valid, ChecksumStatus::Valid]
    );
}

#[test]
fn corruption_is_located() {
    let bytes = stamped().to_bytes().unwrap();

    let mut data_hit = bytes.clone();
    data_hit[BLOCK_SIZE + 100] ^= 0x01;
    let fits = Fits::from_bytes(data_hit).unwrap();
    assert_eq!(fits.units()[0].verify_checksum().unwrap(), ChecksumStatus::DataMismatch);
    assert_eq!(fits.units()[1].verify_checksum().unwrap(), ChecksumStatus::Valid);

    let mut fits = Fits::from_bytes(bytes).unwrap();
    fits.units_mut()[0].header_mut().set("OBJECT", "M52");
    assert_eq!(fits.units()[0].verify_checksum().unwrap(), ChecksumStatus::HeaderMismatch);
}

#[test]
fn unstamped_unit_reports_missing() {
    let hdu = Hdu::from_array(&Array::from_u8(&[3], vec![1, 2, 3]).unwrap(), true).unwrap();
    assert!(matches!(hdu.verify_checksum(), Err(Error::MissingChecksum(_))));
}

#[test]
fn checksums_survive_compression() {
    let fits = stamped();
    let options = CompressionOptions::new(Algorithm::Gzip2).with_quantize_level(None);
    let compressed = fits.compress(&options).unwrap();
    let packed = &compressed.units()[1];
    assert!(packed.header().contains("ZHECKSUM"));
    assert!(!packed.header().contains("CHECKSUM"));

    let restored = compressed.decompress().unwrap();
    assert_eq!(
        restored.verify_checksum().unwrap(),
        vec![ChecksumStatus::Valid, ChecksumStatus::Valid]
    );
}
