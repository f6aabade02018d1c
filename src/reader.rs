//! A small reader over files this crate writes, used to verify round
//! trips. It decodes eagerly and makes no attempt at random access.

use std::io::Read;
use std::mem::size_of;
use std::path::Path;
use std::sync::Arc;

use crate::dict::Dictionaries;
use crate::error::{Result, WriteError};
use crate::parser;
use crate::record::VariantRecord;
use crate::types::{Header, BCF_MAJOR_VERSION, BCF_MINOR_VERSION};

pub struct BcfRecords<R: Read> {
    header: Arc<Header>,
    dict: Dictionaries,
    length_buf: [u8; size_of::<u32>() * 2],
    record_buf: Vec<u8>,
    inner: R,
}

impl<R: Read> BcfRecords<R> {
    pub fn header(&self) -> &Header {
        self.header.as_ref()
    }

    pub fn new(mut reader: R) -> Result<Self> {
        let mut input = [0u8; 5];
        reader.read_exact(&mut input)?;
        let (_, version) = parser::bcf_version(&input)
            .map_err(|_| WriteError::HeaderShape("not a BCF file".to_owned()))?;
        if version.major != BCF_MAJOR_VERSION || version.minor != BCF_MINOR_VERSION {
            return Err(WriteError::HeaderShape(format!(
                "unsupported BCF version {}.{}",
                version.major, version.minor
            )));
        }

        let mut input = [0u8; size_of::<u32>()];
        reader.read_exact(&mut input)?;
        let (_, header_length) = parser::header_length(&input)
            .map_err(|_| WriteError::HeaderShape("truncated header length".to_owned()))?;

        let mut input = vec![0u8; header_length as usize];
        reader.read_exact(&mut input)?;
        let text = String::from_utf8_lossy(&input);
        let header = parser::parse_header_text(&text)?;
        let dict = Dictionaries::from_header(&header, None)?;

        Ok(Self {
            header: Arc::new(header),
            dict,
            length_buf: [0u8; size_of::<u32>() * 2],
            record_buf: Vec::new(),
            inner: reader,
        })
    }
}

impl BcfRecords<Box<dyn Read>> {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let (reader, _format) = niffler::from_path(path)
            .map_err(|e| WriteError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Self::new(reader)
    }
}

impl<R: Read> Iterator for BcfRecords<R> {
    type Item = Result<VariantRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.inner.read_exact(&mut self.length_buf).is_err() {
            return None;
        }
        let (_, (l_shared, l_indiv)) = match parser::record_length(&self.length_buf) {
            Ok(parsed) => parsed,
            Err(_) => {
                return Some(Err(WriteError::RecordShape(
                    "truncated record frame".to_owned(),
                )))
            }
        };
        self.record_buf
            .resize(l_shared as usize + l_indiv as usize, 0);
        if let Err(e) = self.inner.read_exact(&mut self.record_buf) {
            return Some(Err(e.into()));
        }
        Some(parser::record(
            &self.header,
            &self.dict,
            l_shared,
            l_indiv,
            &self.record_buf,
        ))
    }
}
