//! On-the-fly position indexing. The physical index format lives
//! behind [`IndexBuilder`]; the wrapper only guarantees that every
//! observation carries the offset of the first byte of that record's
//! frame, so a seek lands exactly on a record boundary.

use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};
use indexmap::IndexMap;
use log::debug;

use crate::error::{Result, WriteError};
use crate::record::VariantRecord;
use crate::types::Header;
use crate::writer::{BcfWriter, VariantWriter};

pub trait IndexBuilder: Send {
    /// Called once per record with the stream offset the record frame
    /// will start at.
    fn observe(&mut self, record: &VariantRecord, offset: u64) -> Result<()>;

    /// Called once at close with the final stream offset; returns the
    /// serialized index.
    fn finalize(&mut self, end_offset: u64) -> Result<Vec<u8>>;
}

const OFFSET_INDEX_MAGIC: &[u8; 4] = b"BOI\x01";

/// A linear offset index: per contig, the `(start, offset)` pairs in
/// observation order, with the end offset in the trailer.
#[derive(Debug, Default)]
pub struct OffsetIndexBuilder {
    contigs: IndexMap<String, Vec<(i64, u64)>>,
}

impl OffsetIndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexBuilder for OffsetIndexBuilder {
    fn observe(&mut self, record: &VariantRecord, offset: u64) -> Result<()> {
        self.contigs
            .entry(record.chrom.clone())
            .or_default()
            .push((record.start, offset));
        Ok(())
    }

    fn finalize(&mut self, end_offset: u64) -> Result<Vec<u8>> {
        let mut blob = Vec::new();
        blob.extend_from_slice(OFFSET_INDEX_MAGIC);
        blob.write_u32::<LittleEndian>(self.contigs.len() as u32)?;
        for (contig, entries) in &self.contigs {
            blob.write_u16::<LittleEndian>(contig.len() as u16)?;
            blob.extend_from_slice(contig.as_bytes());
            blob.write_u32::<LittleEndian>(entries.len() as u32)?;
            for &(start, offset) in entries {
                blob.write_i64::<LittleEndian>(start)?;
                blob.write_u64::<LittleEndian>(offset)?;
            }
        }
        blob.write_u64::<LittleEndian>(end_offset)?;
        Ok(blob)
    }
}

/// Wraps the core writer and feeds every record's pre-write offset to
/// the index builder; the finished index goes to the companion sink at
/// close. Constructed without an index pair the wrapper is a plain
/// passthrough, which is how a failed index-sink open degrades.
pub struct IndexingWriter<W: Write> {
    inner: BcfWriter<W>,
    index: Option<(Box<dyn IndexBuilder>, Box<dyn Write + Send>)>,
}

impl<W: Write> IndexingWriter<W> {
    pub fn new(
        inner: BcfWriter<W>,
        builder: Box<dyn IndexBuilder>,
        sink: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            inner,
            index: Some((builder, sink)),
        }
    }

    /// Indexing disabled; every call forwards untouched.
    pub fn disabled(inner: BcfWriter<W>) -> Self {
        Self { inner, index: None }
    }

    pub fn is_indexing(&self) -> bool {
        self.index.is_some()
    }

    pub fn position(&self) -> u64 {
        self.inner.position()
    }
}

impl<W: Write> VariantWriter for IndexingWriter<W> {
    fn write_header(&mut self, header: &Header) -> Result<()> {
        self.inner.write_header(header)
    }

    fn add(&mut self, record: VariantRecord) -> Result<()> {
        if let Some((builder, _)) = self.index.as_mut() {
            let offset = self.inner.position();
            builder.observe(&record, offset)?;
        }
        self.inner.add(record)
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()?;
        if let Some((mut builder, mut sink)) = self.index.take() {
            let end_offset = self.inner.position();
            let blob = builder.finalize(end_offset)?;
            sink.write_all(&blob).map_err(WriteError::Io)?;
            sink.flush().map_err(WriteError::Io)?;
            debug!("index written: {} bytes, end offset {}", blob.len(), end_offset);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::record::{Genotype, VariantRecord};
    use crate::types::{FieldType, HeaderFormat, InfoNumber};

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn header() -> Header {
        Header::new()
            .with_contig("1", None)
            .with_format(HeaderFormat::new(
                "GT",
                InfoNumber::Count(1),
                FieldType::String,
                "Genotype",
            ))
            .with_sample("S1")
    }

    fn record(start: i64) -> VariantRecord {
        VariantRecord::new("1", start, vec!["A".into(), "T".into()])
            .with_genotypes(vec![Genotype::new("S1", vec![Some(0), Some(1)], false)])
    }

    #[test]
    fn index_observes_pre_write_offsets() {
        let index_sink = SharedSink::default();
        let mut writer = IndexingWriter::new(
            BcfWriter::new(Vec::new()),
            Box::new(OffsetIndexBuilder::new()),
            Box::new(index_sink.clone()),
        );
        writer.write_header(&header()).unwrap();
        let first_offset = writer.position();
        writer.add(record(100)).unwrap();
        let second_offset = writer.position();
        writer.add(record(200)).unwrap();
        writer.close().unwrap();

        let blob = index_sink.0.lock().unwrap().clone();
        assert_eq!(&blob[..4], OFFSET_INDEX_MAGIC);
        let n_contigs = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]);
        assert_eq!(n_contigs, 1);
        let name_len = u16::from_le_bytes([blob[8], blob[9]]) as usize;
        assert_eq!(&blob[10..10 + name_len], b"1");
        let entries_at = 10 + name_len;
        let n_entries = u32::from_le_bytes([
            blob[entries_at],
            blob[entries_at + 1],
            blob[entries_at + 2],
            blob[entries_at + 3],
        ]);
        assert_eq!(n_entries, 2);
        let first = &blob[entries_at + 4..entries_at + 20];
        assert_eq!(&first[..8], &100i64.to_le_bytes());
        assert_eq!(&first[8..], &first_offset.to_le_bytes());
        let second = &blob[entries_at + 20..entries_at + 36];
        assert_eq!(&second[..8], &200i64.to_le_bytes());
        assert_eq!(&second[8..], &second_offset.to_le_bytes());
    }

    #[test]
    fn disabled_wrapper_is_a_passthrough() {
        let mut writer = IndexingWriter::disabled(BcfWriter::new(Vec::new()));
        assert!(!writer.is_indexing());
        writer.write_header(&header()).unwrap();
        writer.add(record(100)).unwrap();
        writer.close().unwrap();
    }
}
