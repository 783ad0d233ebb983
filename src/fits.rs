use byteorder::{BigEndian, WriteBytesExt};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use fitrs::{Fits, FitsData};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use crate::error::FrameReadError;

const BLOCK_SIZE: usize = 2880;
const CARD_SIZE: usize = 80;
/// Headers longer than this are treated as corrupt
const MAX_HEADER_BLOCKS: usize = 64;

/// Keywords of a primary HDU, read without touching the pixel data
#[derive(Debug, Clone, Default)]
pub struct FitsHeader {
    keywords: HashMap<String, String>,
    /// Bytes up to the start of the data unit
    header_len: usize,
}

impl FitsHeader {
    /// Read only the primary header of a FITS file
    pub fn read(path: &Path) -> Result<Self, FrameReadError> {
        let mut file =
            File::open(path).map_err(|e| FrameReadError::new(path, format!("open failed: {}", e)))?;

        let mut header_data = Vec::new();
        let mut block = [0u8; BLOCK_SIZE];
        for _ in 0..MAX_HEADER_BLOCKS {
            file.read_exact(&mut block)
                .map_err(|_| FrameReadError::new(path, "truncated header (no END card)"))?;
            header_data.extend_from_slice(&block);
            if block.chunks(CARD_SIZE).any(is_end_card) {
                if !header_data.starts_with(b"SIMPLE") {
                    return Err(FrameReadError::new(path, "not a FITS file (no SIMPLE card)"));
                }
                return Ok(Self {
                    keywords: parse_fits_header(&header_data),
                    header_len: header_data.len(),
                });
            }
        }
        Err(FrameReadError::new(
            path,
            format!("no END card in the first {} header blocks", MAX_HEADER_BLOCKS),
        ))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.keywords
            .get(key)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key)
            .and_then(|s| s.replace(['D', 'd'], "E").parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|s| s.parse::<i64>().ok())
    }

    pub fn len(&self) -> usize {
        self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    /// Observation timestamp from `DATE-OBS` plus `UT` (or `TIME-OBS`), or from
    /// a full ISO `DATE-OBS`
    pub fn timestamp(&self) -> Result<NaiveDateTime, String> {
        let date_obs = self.get("DATE-OBS").ok_or("missing DATE-OBS keyword")?;
        if date_obs.contains('T') {
            return parse_iso_timestamp(date_obs)
                .ok_or_else(|| format!("unparsable DATE-OBS '{}'", date_obs));
        }

        let date = NaiveDate::parse_from_str(date_obs, "%Y-%m-%d")
            .map_err(|_| format!("unparsable DATE-OBS '{}'", date_obs))?;
        let ut = self
            .get("UT")
            .or_else(|| self.get("TIME-OBS"))
            .ok_or("missing UT keyword")?;
        let time = parse_time_of_day(ut).ok_or_else(|| format!("unparsable UT '{}'", ut))?;
        Ok(date.and_time(time))
    }
}

fn is_end_card(card: &[u8]) -> bool {
    card.len() >= 3 && &card[..3] == b"END" && card[3..].iter().all(|&b| b == b' ')
}

/// Split 80-character cards into keyword/value pairs. COMMENT and HISTORY
/// cards are skipped and quoted strings keep embedded slashes.
fn parse_fits_header(data: &[u8]) -> HashMap<String, String> {
    let mut keywords = HashMap::new();

    for chunk in data.chunks(CARD_SIZE) {
        if is_end_card(chunk) {
            break;
        }
        if chunk.get(8..10) != Some(b"= ".as_slice()) {
            continue;
        }
        // keyword and value must be valid UTF-8
        let (Ok(keyword), Ok(value_part)) =
            (std::str::from_utf8(&chunk[..8]), std::str::from_utf8(&chunk[10..]))
        else {
            continue;
        };
        let keyword = keyword.trim();
        if keyword.is_empty() || keyword == "COMMENT" || keyword == "HISTORY" {
            continue;
        }

        let value_part = value_part.trim_start();
        let value = if let Some(quoted) = value_part.strip_prefix('\'') {
            // '' is an escaped quote inside a FITS string
            let mut out = String::new();
            let mut chars = quoted.chars().peekable();
            while let Some(c) = chars.next() {
                if c == '\'' {
                    if chars.peek() == Some(&'\'') {
                        out.push('\'');
                        chars.next();
                    } else {
                        break;
                    }
                } else {
                    out.push(c);
                }
            }
            out.trim_end().to_string()
        } else {
            match value_part.find('/') {
                Some(comment_pos) => value_part[..comment_pos].trim().to_string(),
                None => value_part.trim().to_string(),
            }
        };

        keywords.insert(keyword.to_string(), value);
    }

    keywords
}

/// `HH:MM`, `HH:MM:SS` or `HH:MM:SS.fff`
pub fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

pub fn parse_iso_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M"))
        .ok()
}

/// Make sure the primary HDU holds a complete 2D data unit before the
/// pixels are handed to fitrs
fn check_data_unit(path: &Path) -> Result<(), FrameReadError> {
    let header = FitsHeader::read(path)?;
    let naxis = header
        .get_i64("NAXIS")
        .ok_or_else(|| FrameReadError::new(path, "missing NAXIS"))?;
    if naxis < 2 {
        return Err(FrameReadError::new(
            path,
            format!("no 2D image data (NAXIS={})", naxis),
        ));
    }
    let bitpix = header
        .get_i64("BITPIX")
        .filter(|b| matches!(b, 8 | 16 | 32 | 64 | -32 | -64))
        .ok_or_else(|| FrameReadError::new(path, "missing or invalid BITPIX"))?;
    let mut pixels: u64 = 1;
    for axis in 1..=naxis {
        let n = header
            .get_i64(&format!("NAXIS{}", axis))
            .filter(|&n| n > 0)
            .ok_or_else(|| FrameReadError::new(path, format!("missing or empty NAXIS{}", axis)))?;
        pixels = pixels.saturating_mul(n as u64);
    }
    let expected = header.header_len as u64 + pixels.saturating_mul(bitpix.unsigned_abs() / 8);
    let actual = std::fs::metadata(path)
        .map_err(|e| FrameReadError::new(path, format!("stat failed: {}", e)))?
        .len();
    if actual < expected {
        return Err(FrameReadError::new(
            path,
            format!("truncated data unit ({} of {} bytes)", actual, expected),
        ));
    }
    Ok(())
}

/// A 2D image with pixel values scaled to physical units (BZERO/BSCALE applied)
#[derive(Debug, Clone)]
pub struct FitsImage {
    pub width: usize,
    pub height: usize,
    /// Row-major, x fastest; `data[y * width + x]`
    pub data: Vec<f64>,
}

impl FitsImage {
    /// Load the primary HDU pixels using fitrs
    pub fn from_file(path: &Path) -> Result<Self, FrameReadError> {
        check_data_unit(path)?;
        let fits = Fits::open(path)
            .map_err(|e| FrameReadError::new(path, format!("open failed: {}", e)))?;
        let hdu = fits
            .get(0)
            .ok_or_else(|| FrameReadError::new(path, "no primary HDU"))?;

        let int_value = |key: &str| match hdu.value(key) {
            Some(fitrs::HeaderValue::IntegerNumber(n)) => Some(*n as i64),
            _ => None,
        };
        let real_value = |key: &str, default: f64| match hdu.value(key) {
            Some(fitrs::HeaderValue::IntegerNumber(n)) => *n as f64,
            Some(fitrs::HeaderValue::RealFloatingNumber(f)) => *f,
            _ => default,
        };

        let naxis = int_value("NAXIS").ok_or_else(|| FrameReadError::new(path, "missing NAXIS"))?;
        if naxis < 2 {
            return Err(FrameReadError::new(
                path,
                format!("no 2D image data (NAXIS={})", naxis),
            ));
        }
        let width = int_value("NAXIS1")
            .filter(|&n| n > 0)
            .ok_or_else(|| FrameReadError::new(path, "missing or empty NAXIS1"))?
            as usize;
        let height = int_value("NAXIS2")
            .filter(|&n| n > 0)
            .ok_or_else(|| FrameReadError::new(path, "missing or empty NAXIS2"))?
            as usize;
        let bzero = real_value("BZERO", 0.0);
        let bscale = real_value("BSCALE", 1.0);

        let data: Vec<f64> = match hdu.read_data() {
            FitsData::Characters(_) => {
                return Err(FrameReadError::new(path, "character data, not an image"));
            }
            FitsData::IntegersI32(array) => array
                .data
                .iter()
                .map(|v| match v {
                    Some(raw) => *raw as f64 * bscale + bzero,
                    None => f64::NAN,
                })
                .collect(),
            // fitrs has already shifted unsigned data by BZERO
            FitsData::IntegersU32(array) => array
                .data
                .iter()
                .map(|v| match v {
                    Some(raw) => *raw as f64,
                    None => f64::NAN,
                })
                .collect(),
            FitsData::FloatingPoint32(array) => array
                .data
                .iter()
                .map(|v| *v as f64 * bscale + bzero)
                .collect(),
            FitsData::FloatingPoint64(array) => {
                array.data.iter().map(|v| *v * bscale + bzero).collect()
            }
        };

        // Extra axes (e.g. NAXIS3) are ignored; only the first plane is used
        if data.len() < width * height {
            return Err(FrameReadError::new(
                path,
                format!(
                    "data size mismatch: expected {} pixels, got {}",
                    width * height,
                    data.len()
                ),
            ));
        }
        let mut data = data;
        data.truncate(width * height);

        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn get(&self, x: usize, y: usize) -> f64 {
        self.data[y * self.width + x]
    }

    /// Copy a rectangular region, `None` if it does not fit in the image
    pub fn crop(&self, x0: usize, y0: usize, width: usize, height: usize) -> Option<FitsImage> {
        if width == 0 || height == 0 || x0 + width > self.width || y0 + height > self.height {
            return None;
        }
        let mut data = Vec::with_capacity(width * height);
        for y in y0..y0 + height {
            let start = y * self.width + x0;
            data.extend_from_slice(&self.data[start..start + width]);
        }
        Some(FitsImage {
            width,
            height,
            data,
        })
    }
}

/// A header value for [`write_image`]
#[derive(Debug, Clone, PartialEq)]
pub enum CardValue {
    Text(String),
    Integer(i64),
    Real(f64),
    Logical(bool),
}

impl From<&str> for CardValue {
    fn from(s: &str) -> Self {
        CardValue::Text(s.to_string())
    }
}

impl From<f64> for CardValue {
    fn from(v: f64) -> Self {
        CardValue::Real(v)
    }
}

impl From<i64> for CardValue {
    fn from(v: i64) -> Self {
        CardValue::Integer(v)
    }
}

fn format_card(keyword: &str, value: &CardValue) -> String {
    let value_str = match value {
        // Strings start in column 11 and are padded to at least 8 characters
        CardValue::Text(s) => {
            // FITS headers are ASCII only
            let ascii: String = s
                .chars()
                .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '?' })
                .collect();
            format!("'{:<8}'", ascii.replace('\'', "''"))
        }
        // Numbers and logicals are right-justified to column 30
        CardValue::Integer(n) => format!("{:>20}", n),
        CardValue::Real(v) => format!("{:>20}", format_real(*v)),
        CardValue::Logical(b) => format!("{:>20}", if *b { "T" } else { "F" }),
    };
    let mut card = format!("{:<8}= {}", keyword, value_str);
    card.truncate(CARD_SIZE);
    format!("{:<80}", card)
}

fn format_real(v: f64) -> String {
    if v == 0.0 || (v.abs() >= 1e-4 && v.abs() < 1e15) {
        format!("{:?}", v)
    } else {
        format!("{:.8E}", v)
    }
}

/// Write a single-HDU BITPIX=-32 image
pub fn write_image(
    path: &Path,
    width: usize,
    height: usize,
    data: &[f32],
    cards: &[(&str, CardValue)],
) -> std::io::Result<()> {
    if data.len() != width * height {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!(
                "pixel count {} does not match {}x{}",
                data.len(),
                width,
                height
            ),
        ));
    }
    let mut header = vec![
        format_card("SIMPLE", &CardValue::Logical(true)),
        format_card("BITPIX", &CardValue::Integer(-32)),
        format_card("NAXIS", &CardValue::Integer(2)),
        format_card("NAXIS1", &CardValue::Integer(width as i64)),
        format_card("NAXIS2", &CardValue::Integer(height as i64)),
    ];
    for (keyword, value) in cards {
        header.push(format_card(keyword, value));
    }
    header.push(format!("{:<80}", "END"));

    let mut writer = BufWriter::new(File::create(path)?);
    let header_bytes: String = header.concat();
    writer.write_all(header_bytes.as_bytes())?;
    write_padding(&mut writer, header_bytes.len(), b' ')?;

    for &v in data {
        writer.write_f32::<BigEndian>(v)?;
    }
    write_padding(&mut writer, data.len() * 4, 0)?;
    writer.flush()
}

/// Write a header with no data unit (NAXIS = 0)
pub fn write_header_only(path: &Path, cards: &[(&str, CardValue)]) -> std::io::Result<()> {
    let mut header = vec![
        format_card("SIMPLE", &CardValue::Logical(true)),
        format_card("BITPIX", &CardValue::Integer(8)),
        format_card("NAXIS", &CardValue::Integer(0)),
    ];
    for (keyword, value) in cards {
        header.push(format_card(keyword, value));
    }
    header.push(format!("{:<80}", "END"));

    let mut writer = BufWriter::new(File::create(path)?);
    let header_bytes: String = header.concat();
    writer.write_all(header_bytes.as_bytes())?;
    write_padding(&mut writer, header_bytes.len(), b' ')?;
    writer.flush()
}

fn write_padding<W: Write>(writer: &mut W, written: usize, fill: u8) -> std::io::Result<()> {
    let remainder = written % BLOCK_SIZE;
    if remainder != 0 {
        writer.write_all(&vec![fill; BLOCK_SIZE - remainder])?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Write a header from raw 80-byte cards, padded to a full block
    pub(crate) fn write_raw_header(path: &Path, cards: &[Vec<u8>]) {
        let mut bytes = Vec::new();
        for card in cards {
            let mut card = card.clone();
            card.resize(CARD_SIZE, b' ');
            bytes.extend_from_slice(&card);
        }
        let mut end = b"END".to_vec();
        end.resize(CARD_SIZE, b' ');
        bytes.extend_from_slice(&end);
        bytes.resize(bytes.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE, b' ');
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_card_layout() {
        let card = format_card("EXPTIME", &CardValue::Real(30.0));
        assert_eq!(card.len(), 80);
        assert_eq!(&card[..10], "EXPTIME = ");
        assert_eq!(card[10..30].trim(), "30.0");
        assert!(card[..30].ends_with("30.0"));

        let card = format_card("DATE-OBS", &CardValue::from("2024-11-02"));
        assert_eq!(&card[..22], "DATE-OBS= '2024-11-02'");
    }

    #[test]
    fn test_parse_header_cards() {
        let cards = [
            format_card("SIMPLE", &CardValue::Logical(true)),
            format_card("OBJECT", &CardValue::from("NGC 1/2 dither 2")),
            format!("{:<80}", "COMMENT this is ignored"),
            format!("{:<80}", "AIRMASS =                1.234 / effective airmass"),
            format!("{:<80}", "END"),
        ]
        .concat();
        let keywords = parse_fits_header(cards.as_bytes());
        assert_eq!(keywords.get("OBJECT").map(|s| s.as_str()), Some("NGC 1/2 dither 2"));
        assert_eq!(keywords.get("AIRMASS").map(|s| s.as_str()), Some("1.234"));
        assert_eq!(keywords.get("SIMPLE").map(|s| s.as_str()), Some("T"));
        assert!(!keywords.contains_key("COMMENT"));
    }

    #[test]
    fn test_time_parsing() {
        assert_eq!(parse_time_of_day("03:12"), NaiveTime::from_hms_opt(3, 12, 0));
        assert_eq!(parse_time_of_day("03:12:45"), NaiveTime::from_hms_opt(3, 12, 45));
        assert_eq!(
            parse_time_of_day("03:12:45.500"),
            NaiveTime::from_hms_milli_opt(3, 12, 45, 500)
        );
        assert_eq!(parse_time_of_day("3h12"), None);
        assert!(parse_iso_timestamp("2024-11-02T03:12:45.25").is_some());
    }

    #[test]
    fn test_write_then_read_header_and_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.fits");
        let data: Vec<f32> = (0..12).map(|v| v as f32 * 1.5).collect();
        write_image(
            &path,
            4,
            3,
            &data,
            &[
                ("DATE-OBS", CardValue::from("2024-11-02")),
                ("UT", CardValue::from("03:12:45.5")),
                ("EXPTIME", CardValue::Real(2.0)),
            ],
        )
        .unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len() as usize, 2 * BLOCK_SIZE);

        let header = FitsHeader::read(&path).unwrap();
        assert_eq!(header.get_f64("EXPTIME"), Some(2.0));
        assert_eq!(header.get_i64("NAXIS1"), Some(4));
        let ts = header.timestamp().unwrap();
        assert_eq!(ts.to_string(), "2024-11-02 03:12:45.500");

        let image = FitsImage::from_file(&path).unwrap();
        assert_eq!((image.width, image.height), (4, 3));
        assert_eq!(image.get(1, 2), 13.5);
        let crop = image.crop(1, 1, 2, 2).unwrap();
        assert_eq!(crop.data, vec![7.5, 9.0, 13.5, 15.0]);
        assert!(image.crop(3, 0, 2, 2).is_none());
    }

    #[test]
    fn test_header_only_file_has_no_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.fits");
        write_header_only(
            &path,
            &[
                ("DATE-OBS", CardValue::from("2024-11-02T03:00:00")),
                ("EXPTIME", CardValue::Real(2.0)),
            ],
        )
        .unwrap();

        let header = FitsHeader::read(&path).unwrap();
        assert!(header.timestamp().is_ok());
        let err = FitsImage::from_file(&path).unwrap_err();
        assert!(err.reason.contains("NAXIS=0"), "{}", err);
    }

    #[test]
    fn test_missing_keywords_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodate.fits");
        write_header_only(&path, &[("EXPTIME", CardValue::Real(2.0))]).unwrap();
        let header = FitsHeader::read(&path).unwrap();
        assert!(header.timestamp().unwrap_err().contains("DATE-OBS"));

        let garbage = dir.path().join("garbage.fits");
        std::fs::write(&garbage, b"not a fits file").unwrap();
        assert!(FitsHeader::read(&garbage).is_err());
    }

    #[test]
    fn test_non_ascii_cards_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.fits");
        write_raw_header(
            &path,
            &[
                format_card("SIMPLE", &CardValue::Logical(true)).into_bytes(),
                "ABCDEFGé= 1".as_bytes().to_vec(),
                "ABCDEFGHé= 2".as_bytes().to_vec(),
                "OBJECT  = 'M52 ü'".as_bytes().to_vec(),
                format_card("EXPTIME", &CardValue::Real(4.0)).into_bytes(),
            ],
        );

        let header = FitsHeader::read(&path).unwrap();
        assert_eq!(header.get_f64("EXPTIME"), Some(4.0));
        assert_eq!(header.get("OBJECT"), Some("M52 ü"));
        assert_eq!(header.len(), 3);
    }

    #[test]
    fn test_non_ascii_text_values_are_replaced() {
        let card = format_card("OBJECT", &CardValue::from("Café 'é'"));
        assert_eq!(card.len(), CARD_SIZE);
        assert!(card.is_ascii());
        assert!(card.starts_with("OBJECT  = 'Caf? ''?'''"), "{}", card);

        let long = "é".repeat(100);
        assert_eq!(format_card("OBJECT", &CardValue::from(long.as_str())).len(), CARD_SIZE);
    }
}
