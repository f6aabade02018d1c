use std::io::{self, Write};
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};
use indexmap::IndexMap;
use log::{debug, warn};

use crate::dict::Dictionaries;
use crate::encoder::EncodeBuffer;
use crate::error::{Result, WriteError};
use crate::fields::FieldRegistry;
use crate::parser;
use crate::record::{
    Filters, Genotype, GenotypesView, HeaderFingerprint, VariantRecord, DEFAULT_PLOIDY,
};
use crate::types::{Header, HeaderContig, BCF_MAJOR_VERSION, BCF_MINOR_VERSION};

const MAX_ALLELES: usize = u16::MAX as usize;
const MAX_INFO_FIELDS: usize = u16::MAX as usize;
const MAX_FORMAT_FIELDS: usize = u8::MAX as usize;
const MAX_SAMPLES: usize = 0x00FF_FFFF;

/// The writer stack's common surface: one header, any number of
/// records, then exactly one close. Implemented by the core writer and
/// by every wrapper stage, so stages compose freely.
pub trait VariantWriter {
    fn write_header(&mut self, header: &Header) -> Result<()>;
    fn add(&mut self, record: VariantRecord) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

impl<T: VariantWriter + ?Sized> VariantWriter for Box<T> {
    fn write_header(&mut self, header: &Header) -> Result<()> {
        (**self).write_header(header)
    }

    fn add(&mut self, record: VariantRecord) -> Result<()> {
        (**self).add(record)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Counts every byte that reaches the sink, so record start offsets are
/// known without seeking.
#[derive(Debug)]
pub struct CountingWriter<W: Write> {
    inner: W,
    position: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, position: 0 }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.position += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Knobs the builder wires through to the core writer.
#[derive(Debug, Clone, Default)]
pub struct WriterConfig {
    /// Downgrade undeclared INFO/FORMAT/FILTER keys on records to a
    /// logged warning, dropping the offending field.
    pub permissive: bool,
    /// Suppress the FORMAT block entirely.
    pub skip_genotypes: bool,
    /// Contigs to synthesize when the header declares none.
    pub reference_contigs: Option<Vec<HeaderContig>>,
}

impl WriterConfig {
    pub fn new() -> Self {
        Self {
            permissive: false,
            skip_genotypes: false,
            reference_contigs: None,
        }
    }
}

enum State {
    Created,
    Active,
    Closed,
    Failed(String),
}

/// The single-threaded encoding core: writes the BCF2 file frame and
/// one record frame per `add`. Dictionaries and field encoders are
/// frozen by `write_header`; the typed buffer is reused across records.
pub struct BcfWriter<W: Write> {
    out: CountingWriter<W>,
    config: WriterConfig,
    state: State,
    header: Option<Arc<Header>>,
    dict: Option<Dictionaries>,
    registry: Option<FieldRegistry>,
    fingerprint: Option<HeaderFingerprint>,
    buf: EncodeBuffer,
}

impl<W: Write> BcfWriter<W> {
    pub fn new(sink: W) -> Self {
        Self::with_config(sink, WriterConfig::new())
    }

    pub fn with_config(sink: W, config: WriterConfig) -> Self {
        Self {
            out: CountingWriter::new(sink),
            config,
            state: State::Created,
            header: None,
            dict: None,
            registry: None,
            fingerprint: None,
            buf: EncodeBuffer::new(),
        }
    }

    /// Bytes emitted so far; the next record frame starts here.
    pub fn position(&self) -> u64 {
        self.out.position()
    }

    pub fn header(&self) -> Option<&Arc<Header>> {
        self.header.as_ref()
    }

    pub fn dictionaries(&self) -> Option<&Dictionaries> {
        self.dict.as_ref()
    }

    /// The fingerprint lazy genotype payloads are checked against.
    pub fn fingerprint(&self) -> Option<HeaderFingerprint> {
        self.fingerprint
    }

    /// Consumes the writer and hands back the sink.
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    fn guard_active(&self) -> Result<()> {
        match &self.state {
            State::Created => Err(WriteError::Lifecycle(
                "add called before write_header".to_owned(),
            )),
            State::Active => Ok(()),
            State::Closed => Err(WriteError::Lifecycle("add called after close".to_owned())),
            State::Failed(original) => Err(WriteError::poisoned(original)),
        }
    }

    fn fail<T>(&mut self, error: WriteError) -> Result<T> {
        self.state = State::Failed(error.to_string());
        Err(error)
    }

    fn dict(&self) -> &Dictionaries {
        self.dict.as_ref().expect("dictionaries are built in write_header")
    }

    fn registry(&self) -> &FieldRegistry {
        self.registry.as_ref().expect("registry is built in write_header")
    }

    /// The fixed site prefix, id, alleles, FILTER and INFO block.
    fn encode_site(
        &mut self,
        record: &VariantRecord,
        info_keys: &[String],
        filter_offsets: Option<&[i32]>,
        n_format: usize,
    ) -> Result<Vec<u8>> {
        let contig_offset = self.dict().contig_offset(&record.chrom).map_err(|e| {
            WriteError::HeaderShape(format!("{}:{}: {}", record.chrom, record.start, e))
        })?;
        let n_samples = self.header.as_ref().map(|h| h.samples.len()).unwrap_or(0);

        if record.n_alleles() > MAX_ALLELES {
            return Err(WriteError::unsupported(
                &record.chrom,
                record.start,
                "too many alleles for one record frame",
            ));
        }
        if info_keys.len() > MAX_INFO_FIELDS {
            return Err(WriteError::unsupported(
                &record.chrom,
                record.start,
                "too many INFO fields for one record frame",
            ));
        }
        if n_samples > MAX_SAMPLES {
            return Err(WriteError::unsupported(
                &record.chrom,
                record.start,
                "too many samples for one record frame",
            ));
        }

        self.buf.write_raw_i32(contig_offset as i32);
        self.buf.write_raw_i32((record.start - 1) as i32);
        self.buf.write_raw_i32((record.end - record.start + 1) as i32);
        match record.qual {
            Some(qual) => self.buf.write_raw_f32(qual as f32),
            None => self.buf.write_raw_f32_missing(),
        }
        self.buf
            .write_raw_i32(((record.n_alleles() as u32) << 16 | info_keys.len() as u32) as i32);
        self.buf
            .write_raw_i32(((n_format as u32) << 24 | n_samples as u32) as i32);

        match &record.id {
            Some(id) => self.buf.write_typed_string(id.as_bytes()),
            None => self.buf.write_typed_string(b"."),
        }
        for allele in &record.alleles {
            self.buf.write_typed_string(allele.as_bytes());
        }

        match filter_offsets {
            None => self.buf.write_typed_missing(crate::types::TypeKind::Int8),
            Some(offsets) => self.buf.write_typed_ints(offsets),
        }

        for key in info_keys {
            let field = self
                .registry()
                .site(key)
                .expect("info plan only contains declared keys")
                .clone();
            let value = record.info.get(key).expect("info plan keys come from the record");
            field.write_field_key(&mut self.buf);
            field.write_site(&mut self.buf, record, key, value)?;
        }

        Ok(self.buf.extract_and_reset())
    }

    /// The INFO keys that will actually be emitted, with undeclared
    /// keys dropped (permissive) or refused.
    fn plan_info(&self, record: &VariantRecord) -> Result<Vec<String>> {
        let mut keys = Vec::with_capacity(record.info.len());
        for key in record.info.keys() {
            if self.registry().site(key).is_some() {
                keys.push(key.clone());
            } else if self.config.permissive {
                warn!(
                    "{}:{}: dropping INFO {} not declared in the header",
                    record.chrom, record.start, key
                );
            } else {
                return Err(WriteError::header_shape(
                    "INFO",
                    format!(
                        "{}:{}: key {} is not declared in the header",
                        record.chrom, record.start, key
                    ),
                ));
            }
        }
        Ok(keys)
    }

    /// FILTER column plan: `None` for unfiltered, otherwise dictionary
    /// offsets of the active names (or the PASS entry).
    fn plan_filters(&self, record: &VariantRecord) -> Result<Option<Vec<i32>>> {
        match &record.filters {
            Filters::Unfiltered => Ok(None),
            Filters::Pass => Ok(Some(vec![0])),
            Filters::Named(names) => {
                let header = self.header.as_ref().expect("active writer has a header");
                let mut offsets = Vec::with_capacity(names.len());
                for name in names {
                    if !header.has_filter(name) {
                        if self.config.permissive {
                            warn!(
                                "{}:{}: dropping FILTER {} not declared in the header",
                                record.chrom, record.start, name
                            );
                            continue;
                        }
                        return Err(WriteError::header_shape(
                            "FILTER",
                            format!(
                                "{}:{}: filter {} is not declared in the header",
                                record.chrom, record.start, name
                            ),
                        ));
                    }
                    offsets.push(self.dict().string_offset(name)? as i32);
                }
                Ok(Some(offsets))
            }
        }
    }

    /// The FORMAT block and its field count. Lazy payloads whose
    /// fingerprint matches the active header pass through verbatim.
    fn encode_genotypes(&mut self, record: &mut VariantRecord) -> Result<(Vec<u8>, usize)> {
        if self.config.skip_genotypes {
            return Ok((Vec::new(), 0));
        }
        let view = match record.genotypes.take() {
            None => return Ok((Vec::new(), 0)),
            Some(view) => view,
        };

        let decoded = match view {
            GenotypesView::Lazy(lazy) => {
                if Some(lazy.fingerprint) == self.fingerprint {
                    let n_format = lazy.n_format as usize;
                    debug!(
                        "{}:{}: forwarding {} lazy genotype bytes",
                        record.chrom,
                        record.start,
                        lazy.bytes.len()
                    );
                    return Ok((lazy.bytes, n_format));
                }
                // the payload's offsets belong to the source header;
                // expand with that dictionary, re-encode with ours
                let source_dict = Dictionaries::from_header(&lazy.source, None)?;
                parser::decode_genotypes(
                    &lazy.bytes,
                    lazy.n_format as usize,
                    &lazy.source,
                    &source_dict,
                )?
            }
            GenotypesView::Decoded(genotypes) => genotypes,
        };

        let max_ploidy = {
            let record_like = decoded.iter().map(Genotype::ploidy).max().unwrap_or(0);
            record_like.max(DEFAULT_PLOIDY)
        };
        record.genotypes = Some(GenotypesView::Decoded(decoded));

        let header = Arc::clone(self.header.as_ref().expect("active writer has a header"));
        let genotypes = match record.genotypes.as_ref() {
            Some(GenotypesView::Decoded(genotypes)) => genotypes,
            _ => unreachable!(),
        };

        // resolve record genotypes onto the header's sample order
        let mut by_name: IndexMap<&str, &Genotype> = genotypes
            .iter()
            .map(|g| (g.sample.as_str(), g))
            .collect();
        let mut resolved = Vec::with_capacity(header.samples.len());
        for sample in &header.samples {
            match by_name.shift_remove(sample.as_str()) {
                Some(genotype) => resolved.push(genotype.clone()),
                None => resolved.push(Genotype::missing(sample.as_str(), max_ploidy)),
            }
        }
        if !by_name.is_empty() {
            let unknown = by_name.keys().copied().collect::<Vec<_>>().join(",");
            return Err(WriteError::record_shape(
                &record.chrom,
                record.start,
                format!("genotypes for samples absent from the header: {}", unknown),
            ));
        }

        let mut keys = Vec::new();
        for key in record.format_keys(&header) {
            if self.registry().genotype(&key).is_some() {
                keys.push(key);
            } else if self.config.permissive {
                warn!(
                    "{}:{}: dropping FORMAT {} not declared in the header",
                    record.chrom, record.start, key
                );
            } else {
                return Err(WriteError::header_shape(
                    "FORMAT",
                    format!(
                        "{}:{}: key {} is not declared in the header",
                        record.chrom, record.start, key
                    ),
                ));
            }
        }
        if keys.len() > MAX_FORMAT_FIELDS {
            return Err(WriteError::unsupported(
                &record.chrom,
                record.start,
                "too many FORMAT fields for one record frame",
            ));
        }

        for key in &keys {
            let field = self
                .registry()
                .genotype(key)
                .expect("format plan only contains declared keys")
                .clone();
            field.write_field_key(&mut self.buf);
            field.write_genotypes(&mut self.buf, record, key, &resolved, max_ploidy)?;
        }

        let n_format = keys.len();
        Ok((self.buf.extract_and_reset(), n_format))
    }

    fn encode_record(&mut self, record: &mut VariantRecord) -> Result<(Vec<u8>, Vec<u8>)> {
        record.validate()?;
        let info_keys = self.plan_info(record)?;
        let filter_offsets = self.plan_filters(record)?;
        let (genotype_bytes, n_format) = self.encode_genotypes(record)?;
        let site_bytes = self.encode_site(record, &info_keys, filter_offsets.as_deref(), n_format)?;
        Ok((site_bytes, genotype_bytes))
    }
}

impl<W: Write> VariantWriter for BcfWriter<W> {
    /// Writes magic, version, and the NUL-terminated textual header,
    /// then freezes dictionaries and the field encoder registry.
    fn write_header(&mut self, header: &Header) -> Result<()> {
        match self.state {
            State::Created => {}
            State::Active | State::Closed => {
                return Err(WriteError::Lifecycle(
                    "write_header called twice".to_owned(),
                ))
            }
            State::Failed(ref original) => return Err(WriteError::poisoned(original)),
        }

        let dict = Dictionaries::from_header(header, self.config.reference_contigs.as_deref())?;
        let registry = FieldRegistry::from_header(header, &dict)?;
        let fingerprint = HeaderFingerprint::of(header, &dict);

        let text = header.to_vcf_text();
        let result = (|| -> io::Result<()> {
            self.out.write_all(b"BCF")?;
            self.out.write_u8(BCF_MAJOR_VERSION)?;
            self.out.write_u8(BCF_MINOR_VERSION)?;
            self.out.write_u32::<LittleEndian>(text.len() as u32 + 1)?;
            self.out.write_all(text.as_bytes())?;
            self.out.write_u8(0)?;
            Ok(())
        })();
        if let Err(e) = result {
            return self.fail(e.into());
        }

        debug!(
            "header written: {} samples, {} bytes of text",
            header.samples.len(),
            text.len()
        );
        self.header = Some(Arc::new(header.clone()));
        self.dict = Some(dict);
        self.registry = Some(registry);
        self.fingerprint = Some(fingerprint);
        self.state = State::Active;
        Ok(())
    }

    fn add(&mut self, mut record: VariantRecord) -> Result<()> {
        self.guard_active()?;
        let (site_bytes, genotype_bytes) = match self.encode_record(&mut record) {
            Ok(frames) => frames,
            Err(e) => {
                // a rejected record must not leave partial bytes behind
                self.buf.extract_and_reset();
                return Err(e);
            }
        };
        debug_assert!(!site_bytes.is_empty());

        let result = (|| -> io::Result<()> {
            self.out
                .write_u32::<LittleEndian>(site_bytes.len() as u32)?;
            self.out
                .write_u32::<LittleEndian>(genotype_bytes.len() as u32)?;
            self.out.write_all(&site_bytes)?;
            self.out.write_all(&genotype_bytes)?;
            Ok(())
        })();
        if let Err(e) = result {
            return self.fail(e.into());
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        match self.state {
            State::Created | State::Active => {}
            State::Closed => return Ok(()),
            State::Failed(ref original) => return Err(WriteError::poisoned(original)),
        }
        if let Err(e) = self.out.flush() {
            return self.fail(e.into());
        }
        self.state = State::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldType, HeaderFormat, HeaderInfo, InfoNumber};

    fn header() -> Header {
        Header::new()
            .with_contig("1", Some(1000))
            .with_contig("2", None)
            .with_info(HeaderInfo::new(
                "DP",
                InfoNumber::Count(1),
                FieldType::Integer,
                "Total depth",
            ))
            .with_format(HeaderFormat::new(
                "GT",
                InfoNumber::Count(1),
                FieldType::String,
                "Genotype",
            ))
            .with_sample("S1")
    }

    fn snp() -> VariantRecord {
        VariantRecord::new("1", 100, vec!["A".into(), "C".into()])
            .with_qual(29.0)
            .with_info("DP", 14)
            .with_genotypes(vec![Genotype::new("S1", vec![Some(0), Some(1)], false)])
    }

    #[test]
    fn lifecycle_is_enforced() {
        let mut writer = BcfWriter::new(Vec::new());
        assert!(matches!(
            writer.add(snp()),
            Err(WriteError::Lifecycle(_))
        ));
        writer.write_header(&header()).unwrap();
        assert!(matches!(
            writer.write_header(&header()),
            Err(WriteError::Lifecycle(_))
        ));
        writer.add(snp()).unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
        assert!(matches!(
            writer.add(snp()),
            Err(WriteError::Lifecycle(_))
        ));
    }

    #[test]
    fn file_frame_starts_with_magic_and_header_block() {
        let mut writer = BcfWriter::new(Vec::new());
        writer.write_header(&header()).unwrap();
        writer.close().unwrap();
        let bytes = writer.out.into_inner();
        assert_eq!(&bytes[..5], b"BCF\x02\x01");
        let len = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
        assert_eq!(bytes.len(), 9 + len);
        assert_eq!(bytes[bytes.len() - 1], 0);
        let text = std::str::from_utf8(&bytes[9..bytes.len() - 1]).unwrap();
        assert!(text.starts_with("##fileformat=VCFv4.2\n"));
    }

    #[test]
    fn site_prefix_matches_the_reference_layout() {
        let mut writer = BcfWriter::new(Vec::new());
        writer.write_header(&header()).unwrap();
        let before = writer.position();
        writer.add(snp()).unwrap();
        writer.close().unwrap();
        let bytes = writer.out.into_inner();
        let frame = &bytes[before as usize..];
        let site_len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let gt_len = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
        assert_eq!(frame.len(), 8 + site_len + gt_len);

        let site = &frame[8..8 + site_len];
        assert_eq!(&site[0..4], &[0x00, 0x00, 0x00, 0x00]); // contig 0
        assert_eq!(&site[4..8], &[0x63, 0x00, 0x00, 0x00]); // pos 99
        assert_eq!(&site[8..12], &[0x01, 0x00, 0x00, 0x00]); // rlen 1
        assert_eq!(&site[12..16], &29.0f32.to_le_bytes()); // qual
        assert_eq!(&site[16..20], &[0x01, 0x00, 0x02, 0x00]); // n_info=1, n_allele=2
        assert_eq!(&site[20..24], &[0x01, 0x00, 0x00, 0x01]); // n_sample=1, n_fmt=1
        assert_eq!(&site[24..26], &[0x17, b'.']); // id "."
        assert_eq!(&site[26..30], &[0x17, b'A', 0x17, b'C']); // alleles
        assert_eq!(site[30], 0x01); // unfiltered
        // INFO: key offset for DP, then 14 as typed INT8
        assert_eq!(&site[31..], &[0x11, 0x01, 0x11, 0x0E]);

        // GT: key offset 2, pair descriptor, 0/1 unphased
        let gt = &frame[8 + site_len..];
        assert_eq!(gt, &[0x11, 0x02, 0x21, 0x02, 0x04]);
    }

    #[test]
    fn pass_and_named_filters_use_dictionary_offsets() {
        let header = header().with_filter(crate::types::HeaderFilter::new(
            "q10",
            "Quality below 10",
        ));
        let mut writer = BcfWriter::new(Vec::new());
        writer.write_header(&header).unwrap();
        let mut pass = snp();
        pass.filters = Filters::Pass;
        writer.add(pass).unwrap();
        let mut named = snp();
        named.filters = Filters::Named(vec!["q10".into()]);
        writer.add(named).unwrap();
        writer.close().unwrap();
        let bytes = writer.out.into_inner();
        // PASS is offset 0, q10 sits behind it
        let text = bytes.as_slice();
        assert!(windows_contains(text, &[0x11, 0x00])); // [PASS]
        assert!(windows_contains(text, &[0x11, 0x01])); // [q10]
    }

    fn windows_contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn unknown_info_key_is_fatal_unless_permissive() {
        let mut writer = BcfWriter::new(Vec::new());
        writer.write_header(&header()).unwrap();
        let record = snp().with_info("XX", 1);
        assert!(matches!(
            writer.add(record),
            Err(WriteError::HeaderShape(_))
        ));

        let mut config = WriterConfig::new();
        config.permissive = true;
        let mut writer = BcfWriter::with_config(Vec::new(), config);
        writer.write_header(&header()).unwrap();
        let record = snp().with_info("XX", 1);
        writer.add(record).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn genotypes_can_be_suppressed() {
        let mut config = WriterConfig::new();
        config.skip_genotypes = true;
        let mut writer = BcfWriter::with_config(Vec::new(), config);
        writer.write_header(&header()).unwrap();
        let before = writer.position();
        writer.add(snp()).unwrap();
        writer.close().unwrap();
        let bytes = writer.out.into_inner();
        let frame = &bytes[before as usize..];
        let gt_len = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        assert_eq!(gt_len, 0);
        // n_fmt byte in the prefix is zero as well
        let site = &frame[8..];
        assert_eq!(site[23], 0);
    }

    #[test]
    fn missing_sample_is_synthesized_at_max_ploidy() {
        let header = header().with_sample("S2");
        let mut writer = BcfWriter::new(Vec::new());
        writer.write_header(&header).unwrap();
        let before = writer.position();
        writer.add(snp()).unwrap();
        writer.close().unwrap();
        let bytes = writer.out.into_inner();
        let frame = &bytes[before as usize..];
        let site_len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let gt = &frame[8 + site_len..];
        // key, descriptor, S1 = 0/1, S2 = ./.
        assert_eq!(gt, &[0x11, 0x02, 0x21, 0x02, 0x04, 0x00, 0x00]);
    }
}
