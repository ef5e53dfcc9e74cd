//! Header cards, the ordered keyword mapping, and structural validation.

use std::io::Read;

use crate::block::{padded_byte_len, BLOCK_SIZE, CARDS_PER_BLOCK, CARD_SIZE, HEADER_PAD_BYTE};
use crate::error::{Error, Result};
use crate::value::{format_value, parse_value, Value, VALUE_FIELD_LEN};

// ── Types ──

/// One 80-byte keyword record.
#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    /// Upper-case keyword without trailing blanks.
    pub keyword: String,
    /// The value, if the card has a value indicator and a defined value.
    pub value: Option<Value>,
    pub comment: Option<String>,
}

impl Card {
    pub fn new(keyword: &str, value: impl Into<Value>, comment: Option<&str>) -> Self {
        Card {
            keyword: keyword.to_string(),
            value: Some(value.into()),
            comment: comment.map(str::to_string),
        }
    }

    /// A COMMENT or HISTORY record.
    pub fn commentary(keyword: &str, text: &str) -> Self {
        Card {
            keyword: keyword.to_string(),
            value: None,
            comment: Some(text.to_string()),
        }
    }

    /// COMMENT, HISTORY or blank keyword.
    pub fn is_commentary(&self) -> bool {
        is_commentary_keyword(&self.keyword)
    }
}

/// Kind of unit a header describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HduKind {
    Primary,
    Image,
    BinaryTable,
    /// ASCII tables and unknown extensions, carried as opaque bytes.
    Other,
}

fn is_commentary_keyword(keyword: &str) -> bool {
    matches!(keyword, "COMMENT" | "HISTORY" | "")
}

/// Check keyword syntax: at most 8 of `A-Z 0-9 - _`.
pub fn validate_keyword(keyword: &str) -> Result<()> {
    let ok = keyword.len() <= 8
        && keyword
            .bytes()
            .all(|b| matches!(b, b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_'));
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidKeyword(keyword.to_string()))
    }
}

// ── Parsing ──

/// Parse a single card image. Returns `None` for END.
pub fn parse_card(bytes: &[u8; CARD_SIZE]) -> Result<Option<Card>> {
    let keyword = std::str::from_utf8(&bytes[..8])
        .map_err(|_| Error::InvalidKeyword(String::from_utf8_lossy(&bytes[..8]).into_owned()))?
        .trim_end();
    if keyword == "END" {
        return Ok(None);
    }
    validate_keyword(keyword)?;

    let rest = &bytes[8..];
    if !is_commentary_keyword(keyword) && rest.starts_with(b"= ") {
        let field = &rest[2..];
        let (value, comment) = match parse_value(field) {
            Some((v, c)) => (Some(v), c),
            None => (None, undefined_comment(field)),
        };
        return Ok(Some(Card {
            keyword: keyword.to_string(),
            value,
            comment,
        }));
    }

    let text = String::from_utf8_lossy(rest).trim_end().to_string();
    Ok(Some(Card {
        keyword: keyword.to_string(),
        value: None,
        comment: (!text.is_empty()).then_some(text),
    }))
}

fn undefined_comment(field: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(field);
    let (_, after) = text.split_once('/')?;
    let after = after.trim();
    (!after.is_empty()).then(|| after.to_string())
}

// ── Writing ──

/// Render a card into 80 bytes.
pub fn format_card(card: &Card) -> Result<[u8; CARD_SIZE]> {
    validate_keyword(&card.keyword)?;
    let mut buf = [b' '; CARD_SIZE];
    buf[..card.keyword.len()].copy_from_slice(card.keyword.as_bytes());

    if card.is_commentary() {
        if let Some(text) = &card.comment {
            let n = text.len().min(CARD_SIZE - 8);
            buf[8..8 + n].copy_from_slice(&text.as_bytes()[..n]);
        }
        return Ok(buf);
    }

    buf[8] = b'=';
    let (field, used) = match &card.value {
        Some(v) => format_value(v)
            .ok_or_else(|| Error::InvalidValue(card.keyword.clone()))?,
        None => ([b' '; VALUE_FIELD_LEN], 20),
    };
    buf[10..].copy_from_slice(&field);

    if let Some(comment) = &card.comment {
        let start = 10 + used + 3;
        if start < CARD_SIZE {
            buf[10 + used + 1] = b'/';
            let n = comment.len().min(CARD_SIZE - start);
            buf[start..start + n].copy_from_slice(&comment.as_bytes()[..n]);
        }
    }
    Ok(buf)
}

// ── Header ──

/// Ordered keyword mapping of one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    cards: Vec<Card>,
}

impl Header {
    pub fn new() -> Self {
        Header::default()
    }

    /// Parse header blocks at the start of `data`. Returns the header and the
    /// number of bytes it occupies (a multiple of the block size).
    pub fn parse(data: &[u8]) -> Result<(Header, usize)> {
        let mut cards = Vec::new();
        for (block_idx, block) in data.chunks_exact(BLOCK_SIZE).enumerate() {
            for raw in block.chunks_exact(CARD_SIZE) {
                let raw: &[u8; CARD_SIZE] = raw
                    .try_into()
                    .map_err(|_| Error::InvalidHeader("short card".into()))?;
                match parse_card(raw)? {
                    Some(card) => cards.push(card),
                    None => return Ok((Header { cards }, (block_idx + 1) * BLOCK_SIZE)),
                }
            }
        }
        Err(Error::UnexpectedEof)
    }

    /// Read header blocks from a stream. Returns `Ok(None)` at a clean end of
    /// stream (no bytes before the first block).
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Option<(Header, usize)>> {
        let mut cards = Vec::new();
        let mut block = vec![0u8; BLOCK_SIZE];
        let mut consumed = 0usize;
        loop {
            let got = read_full(reader, &mut block)?;
            if got == 0 && consumed == 0 {
                return Ok(None);
            }
            if got < BLOCK_SIZE {
                return Err(Error::UnexpectedEof);
            }
            consumed += BLOCK_SIZE;
            for raw in block.chunks_exact(CARD_SIZE) {
                let raw: &[u8; CARD_SIZE] = raw
                    .try_into()
                    .map_err(|_| Error::InvalidHeader("short card".into()))?;
                match parse_card(raw)? {
                    Some(card) => cards.push(card),
                    None => return Ok(Some((Header { cards }, consumed))),
                }
            }
        }
    }

    /// Serialize to complete padded blocks, ending with END.
    ///
    /// Nothing is produced when any card cannot be rendered.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.byte_len());
        for card in &self.cards {
            out.extend_from_slice(&format_card(card)?);
        }
        let mut end = [b' '; CARD_SIZE];
        end[..3].copy_from_slice(b"END");
        out.extend_from_slice(&end);
        out.resize(padded_byte_len(out.len()), HEADER_PAD_BYTE);
        Ok(out)
    }

    /// Serialized length including END and padding.
    pub fn byte_len(&self) -> usize {
        (self.cards.len() + 1).div_ceil(CARDS_PER_BLOCK) * BLOCK_SIZE
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn position(&self, keyword: &str) -> Option<usize> {
        self.cards.iter().position(|c| c.keyword == keyword)
    }

    pub fn contains(&self, keyword: &str) -> bool {
        self.position(keyword).is_some()
    }

    pub fn card(&self, keyword: &str) -> Option<&Card> {
        self.cards.iter().find(|c| c.keyword == keyword)
    }

    pub fn get(&self, keyword: &str) -> Option<&Value> {
        self.card(keyword).and_then(|c| c.value.as_ref())
    }

    pub fn get_int(&self, keyword: &str) -> Option<i64> {
        self.get(keyword).and_then(Value::as_int)
    }

    pub fn get_float(&self, keyword: &str) -> Option<f64> {
        self.get(keyword).and_then(Value::as_float)
    }

    pub fn get_bool(&self, keyword: &str) -> Option<bool> {
        self.get(keyword).and_then(Value::as_bool)
    }

    pub fn get_str(&self, keyword: &str) -> Option<&str> {
        self.get(keyword).and_then(Value::as_str)
    }

    /// Integer keyword that must be present.
    pub fn require_int(&self, keyword: &str) -> Result<i64> {
        match self.get(keyword) {
            None => Err(Error::MissingKeyword(keyword.to_string())),
            Some(v) => v.as_int().ok_or_else(|| Error::InvalidValue(keyword.to_string())),
        }
    }

    /// Non-negative integer keyword that must be present.
    pub fn require_usize(&self, keyword: &str) -> Result<usize> {
        let n = self.require_int(keyword)?;
        usize::try_from(n).map_err(|_| Error::InvalidValue(keyword.to_string()))
    }

    pub fn require_str(&self, keyword: &str) -> Result<&str> {
        match self.get(keyword) {
            None => Err(Error::MissingKeyword(keyword.to_string())),
            Some(v) => v.as_str().ok_or_else(|| Error::InvalidValue(keyword.to_string())),
        }
    }

    /// Set a keyword, replacing the value in place when present (the comment
    /// is kept) and appending otherwise.
    pub fn set(&mut self, keyword: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.cards.iter_mut().find(|c| c.keyword == keyword) {
            Some(card) => card.value = Some(value),
            None => self.cards.push(Card {
                keyword: keyword.to_string(),
                value: Some(value),
                comment: None,
            }),
        }
    }

    /// Set a keyword and its comment.
    pub fn set_with_comment(&mut self, keyword: &str, value: impl Into<Value>, comment: &str) {
        self.set(keyword, value);
        if let Some(card) = self.cards.iter_mut().find(|c| c.keyword == keyword) {
            card.comment = Some(comment.to_string());
        }
    }

    /// Insert a card at `index`, removing any earlier card with the same keyword.
    pub fn insert(&mut self, index: usize, card: Card) {
        let mut index = index;
        if !card.is_commentary() {
            if let Some(old) = self.position(&card.keyword) {
                self.cards.remove(old);
                if old < index {
                    index -= 1;
                }
            }
        }
        self.cards.insert(index.min(self.cards.len()), card);
    }

    /// Insert or move a card to sit directly after `anchor` (or at the end
    /// when `anchor` is absent).
    pub fn set_after(&mut self, anchor: &str, card: Card) {
        let at = self.position(anchor).map_or(self.cards.len(), |i| i + 1);
        self.insert(at, card);
    }

    pub fn push(&mut self, card: Card) {
        self.cards.push(card);
    }

    pub fn remove(&mut self, keyword: &str) -> Option<Card> {
        let at = self.position(keyword)?;
        Some(self.cards.remove(at))
    }

    pub fn add_history(&mut self, text: &str) {
        self.cards.push(Card::commentary("HISTORY", text));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Card> {
        self.cards.iter()
    }

    // ── Structure ──

    pub fn kind(&self) -> HduKind {
        match self.cards.first().map(|c| c.keyword.as_str()) {
            Some("SIMPLE") => HduKind::Primary,
            Some("XTENSION") => match self.get_str("XTENSION").map(str::trim) {
                Some("IMAGE") => HduKind::Image,
                Some("BINTABLE") => HduKind::BinaryTable,
                _ => HduKind::Other,
            },
            _ => HduKind::Other,
        }
    }

    pub fn bitpix(&self) -> Result<i64> {
        let b = self.require_int("BITPIX")?;
        match b {
            8 | 16 | 32 | 64 | -32 | -64 => Ok(b),
            other => Err(Error::InvalidBitpix(other)),
        }
    }

    /// NAXISn values in FITS order.
    pub fn axes(&self) -> Result<Vec<usize>> {
        let naxis = self.require_usize("NAXIS")?;
        if naxis > 999 {
            return Err(Error::InvalidValue("NAXIS".into()));
        }
        (1..=naxis)
            .map(|i| self.require_usize(&format!("NAXIS{i}")))
            .collect()
    }

    /// Size of the data area in bytes, without padding.
    pub fn data_len(&self) -> Result<usize> {
        let bitpix = self.bitpix()?;
        let axes = self.axes()?;
        let random_groups = axes.first() == Some(&0) && self.get_bool("GROUPS") == Some(true);
        let elements = if axes.is_empty() {
            0
        } else if random_groups {
            axes[1..].iter().product::<usize>()
        } else {
            axes.iter().product::<usize>()
        };
        let pcount = self.get_int("PCOUNT").unwrap_or(0).max(0) as usize;
        let gcount = self.get_int("GCOUNT").unwrap_or(1).max(0) as usize;
        if elements == 0 && pcount == 0 {
            return Ok(0);
        }
        Ok(bitpix.unsigned_abs() as usize / 8 * gcount * (pcount + elements))
    }

    /// Check the mandatory structural keywords for the header kind.
    pub fn validate(&self, primary: bool) -> Result<()> {
        let first = self.cards.first().map(|c| c.keyword.as_str());
        let expected_first = if primary { "SIMPLE" } else { "XTENSION" };
        if first != Some(expected_first) {
            return Err(Error::MissingKeyword(expected_first.to_string()));
        }
        if primary && self.get_bool("SIMPLE") != Some(true) {
            return Err(Error::InvalidValue("SIMPLE".into()));
        }
        self.require_at(1, "BITPIX")?;
        self.bitpix()?;
        self.require_at(2, "NAXIS")?;
        let naxis = self.axes()?.len();
        for i in 1..=naxis {
            self.require_at(2 + i, &format!("NAXIS{i}"))?;
        }
        if !primary {
            self.require_int("PCOUNT")?;
            self.require_int("GCOUNT")?;
        }
        if self.kind() == HduKind::BinaryTable {
            if self.bitpix()? != 8 || naxis != 2 {
                return Err(Error::InvalidHeader("binary table needs BITPIX 8, NAXIS 2".into()));
            }
            self.require_int("TFIELDS")?;
        }
        Ok(())
    }

    fn require_at(&self, index: usize, keyword: &str) -> Result<()> {
        match self.cards.get(index) {
            Some(c) if c.keyword == keyword => Ok(()),
            _ if self.contains(keyword) => {
                Err(Error::InvalidHeader(format!("{keyword} out of order")))
            }
            _ => Err(Error::MissingKeyword(keyword.to_string())),
        }
    }
}

/// Fill `buf` from the reader, returning the number of bytes obtained before EOF.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_card(s: &str) -> [u8; CARD_SIZE] {
        let mut buf = [b' '; CARD_SIZE];
        buf[..s.len()].copy_from_slice(s.as_bytes());
        buf
    }

    fn image_header(axes: &[usize]) -> Header {
        let mut h = Header::new();
        h.push(Card::new("SIMPLE", true, None));
        h.push(Card::new("BITPIX", 16i64, Some("bits per pixel")));
        h.push(Card::new("NAXIS", axes.len(), None));
        for (i, &n) in axes.iter().enumerate() {
            h.push(Card::new(&format!("NAXIS{}", i + 1), n, None));
        }
        h
    }

    // ---- parse_card ----

    #[test]
    fn parse_card_value_and_comment() {
        let card = parse_card(&make_card("NAXIS1  =                  100 / width"))
            .unwrap()
            .unwrap();
        assert_eq!(card.keyword, "NAXIS1");
        assert_eq!(card.value, Some(Value::Integer(100)));
        assert_eq!(card.comment.as_deref(), Some("width"));
    }

    #[test]
    fn parse_card_end() {
        assert!(parse_card(&make_card("END")).unwrap().is_none());
    }

    #[test]
    fn parse_card_history_text() {
        let card = parse_card(&make_card("HISTORY = not a value")).unwrap().unwrap();
        assert!(card.value.is_none());
        assert_eq!(card.comment.as_deref(), Some("= not a value"));
    }

    #[test]
    fn parse_card_rejects_lowercase() {
        let err = parse_card(&make_card("naxis   =                    2")).unwrap_err();
        assert!(matches!(err, Error::InvalidKeyword(_)));
    }

    #[test]
    fn parse_card_undefined_value() {
        let card = parse_card(&make_card("BLANK   =                      / unset"))
            .unwrap()
            .unwrap();
        assert!(card.value.is_none());
        assert_eq!(card.comment.as_deref(), Some("unset"));
    }

    // ---- format_card ----

    #[test]
    fn format_card_layout() {
        let bytes = format_card(&Card::new("BITPIX", 16i64, Some("bits"))).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert_eq!(&text[..30], "BITPIX  =                   16");
        assert_eq!(&text[30..37], " / bits");
    }

    #[test]
    fn format_card_rejects_long_keyword() {
        let err = format_card(&Card::new("TOOLONGKEY", 1i64, None)).unwrap_err();
        assert!(matches!(err, Error::InvalidKeyword(_)));
    }

    // ---- Header ----

    #[test]
    fn serialize_then_parse() {
        let mut h = image_header(&[10, 20]);
        h.set_with_comment("OBJECT", "M31", "target");
        h.add_history("made by a test");
        let bytes = h.to_bytes().unwrap();
        assert_eq!(bytes.len(), BLOCK_SIZE);
        assert_eq!(h.byte_len(), BLOCK_SIZE);
        let (parsed, used) = Header::parse(&bytes).unwrap();
        assert_eq!(used, BLOCK_SIZE);
        assert_eq!(parsed, h);
    }

    #[test]
    fn header_spanning_blocks() {
        let mut h = image_header(&[1]);
        for i in 0..40 {
            h.set(&format!("KEY{i}"), i as i64);
        }
        let bytes = h.to_bytes().unwrap();
        assert_eq!(bytes.len(), 2 * BLOCK_SIZE);
        let (parsed, used) = Header::parse(&bytes).unwrap();
        assert_eq!(used, 2 * BLOCK_SIZE);
        assert_eq!(parsed.get_int("KEY39"), Some(39));
    }

    #[test]
    fn parse_without_end_is_eof() {
        let blank = vec![b' '; BLOCK_SIZE];
        assert!(matches!(Header::parse(&blank), Err(Error::UnexpectedEof)));
    }

    #[test]
    fn read_from_stream() {
        let bytes = image_header(&[4]).to_bytes().unwrap();
        let mut cursor = std::io::Cursor::new(bytes);
        let (h, used) = Header::read_from(&mut cursor).unwrap().unwrap();
        assert_eq!(used, BLOCK_SIZE);
        assert_eq!(h.axes().unwrap(), vec![4]);
        assert!(Header::read_from(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn set_replaces_in_place() {
        let mut h = image_header(&[3]);
        h.set("BITPIX", -32i64);
        assert_eq!(h.position("BITPIX"), Some(1));
        assert_eq!(h.get_int("BITPIX"), Some(-32));
        assert_eq!(h.card("BITPIX").unwrap().comment.as_deref(), Some("bits per pixel"));
        assert_eq!(h.get_float("BITPIX"), Some(-32.0));
        h.set("BSCALE", 0.5);
        assert_eq!(h.get_float("BSCALE"), Some(0.5));
        assert_eq!(h.get_int("BSCALE"), None);
    }

    #[test]
    fn set_after_moves_card() {
        let mut h = image_header(&[3]);
        h.set("EXTEND", true);
        h.set_after("NAXIS1", Card::new("EXTEND", true, None));
        assert_eq!(h.position("EXTEND"), Some(4));
        assert_eq!(h.len(), 5);
    }

    #[test]
    fn remove_and_contains() {
        let mut h = image_header(&[3]);
        assert!(h.remove("NAXIS1").is_some());
        assert!(!h.contains("NAXIS1"));
        assert!(matches!(h.axes(), Err(Error::MissingKeyword(_))));
    }

    #[test]
    fn data_len_image() {
        assert_eq!(image_header(&[10, 20]).data_len().unwrap(), 400);
        assert_eq!(image_header(&[]).data_len().unwrap(), 0);
    }

    #[test]
    fn data_len_with_heap() {
        let mut h = Header::new();
        h.push(Card::new("XTENSION", "BINTABLE", None));
        h.push(Card::new("BITPIX", 8i64, None));
        h.push(Card::new("NAXIS", 2i64, None));
        h.push(Card::new("NAXIS1", 8i64, None));
        h.push(Card::new("NAXIS2", 3i64, None));
        h.push(Card::new("PCOUNT", 100i64, None));
        h.push(Card::new("GCOUNT", 1i64, None));
        h.push(Card::new("TFIELDS", 1i64, None));
        assert_eq!(h.kind(), HduKind::BinaryTable);
        assert_eq!(h.data_len().unwrap(), 124);
        h.validate(false).unwrap();
    }

    #[test]
    fn validate_primary() {
        image_header(&[2, 2]).validate(true).unwrap();
        let mut h = image_header(&[2, 2]);
        h.set("BITPIX", 12i64);
        assert!(matches!(h.validate(true), Err(Error::InvalidBitpix(12))));
        let mut h = image_header(&[2, 2]);
        h.remove("SIMPLE");
        assert!(matches!(h.validate(true), Err(Error::MissingKeyword(_))));
    }

    #[test]
    fn validate_extension_needs_pcount() {
        let mut h = Header::new();
        h.push(Card::new("XTENSION", "IMAGE", None));
        h.push(Card::new("BITPIX", 8i64, None));
        h.push(Card::new("NAXIS", 0i64, None));
        assert!(matches!(h.validate(false), Err(Error::MissingKeyword(k)) if k == "PCOUNT"));
    }
}
