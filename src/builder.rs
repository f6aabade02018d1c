//! Driver-facing construction: an option set, the stage composition
//! (async queue, sort buffer, indexing, core writer) and sink plumbing
//! (gzip paths, MD5 tee).

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use indexmap::IndexSet;
use log::warn;
use strum::{Display, EnumString};

use crate::error::{Result, WriteError};
use crate::index::{IndexBuilder, IndexingWriter, OffsetIndexBuilder};
use crate::queue::{AsyncWriter, DEFAULT_QUEUE_CAPACITY};
use crate::sort::SortingWriter;
use crate::types::HeaderContig;
use crate::writer::{BcfWriter, VariantWriter, WriterConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum WriterOption {
    IndexOnTheFly,
    DoNotWriteGenotypes,
    AllowMissingFieldsInHeader,
    ForceBcf,
    UseAsyncIo,
    ComputeMd5,
}

/// Hashes everything written through it; the digest is read through the
/// shared [`Md5Handle`] once the stream is complete.
pub struct Md5Tee<W: Write> {
    inner: W,
    context: Arc<Mutex<md5::Context>>,
}

#[derive(Clone)]
pub struct Md5Handle(Arc<Mutex<md5::Context>>);

impl<W: Write> Md5Tee<W> {
    pub fn new(inner: W) -> (Self, Md5Handle) {
        let context = Arc::new(Mutex::new(md5::Context::new()));
        let handle = Md5Handle(Arc::clone(&context));
        (Self { inner, context }, handle)
    }
}

impl Md5Handle {
    /// The digest over all bytes written so far, as lowercase hex.
    pub fn hex(&self) -> String {
        let context = self.0.lock().unwrap().clone();
        format!("{:x}", context.compute())
    }
}

impl<W: Write> Write for Md5Tee<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.context.lock().unwrap().consume(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Assembles a writer stack. Stages are attached outermost-first at
/// build time: async queue, sort buffer, indexing wrapper, core writer.
pub struct WriterBuilder {
    options: IndexSet<WriterOption>,
    sort_window: Option<i64>,
    queue_capacity: usize,
    reference_contigs: Option<Vec<HeaderContig>>,
    index_builder: Option<Box<dyn IndexBuilder>>,
    index_sink: Option<Box<dyn Write + Send>>,
}

impl Default for WriterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WriterBuilder {
    pub fn new() -> Self {
        Self {
            options: IndexSet::new(),
            sort_window: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reference_contigs: None,
            index_builder: None,
            index_sink: None,
        }
    }

    pub fn option(mut self, option: WriterOption) -> Self {
        self.options.insert(option);
        self
    }

    pub fn unset_option(mut self, option: WriterOption) -> Self {
        self.options.shift_remove(&option);
        self
    }

    pub fn is_set(&self, option: WriterOption) -> bool {
        self.options.contains(&option)
    }

    /// Enables the sorting stage with the given out-of-order window, in
    /// reference positions.
    pub fn sort_window(mut self, window: i64) -> Self {
        self.sort_window = Some(window);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Contigs to synthesize into the dictionary when the header has no
    /// contig lines of its own.
    pub fn reference_contigs(mut self, contigs: Vec<HeaderContig>) -> Self {
        self.reference_contigs = Some(contigs);
        self
    }

    /// Replaces the default [`OffsetIndexBuilder`].
    pub fn index_builder(mut self, builder: Box<dyn IndexBuilder>) -> Self {
        self.index_builder = Some(builder);
        self
    }

    /// Where the serialized index goes when `IndexOnTheFly` is set and
    /// the writer is built over a raw sink rather than a path.
    pub fn index_sink(mut self, sink: Box<dyn Write + Send>) -> Self {
        self.index_sink = Some(sink);
        self
    }

    fn config(&self) -> WriterConfig {
        WriterConfig {
            permissive: self.is_set(WriterOption::AllowMissingFieldsInHeader),
            skip_genotypes: self.is_set(WriterOption::DoNotWriteGenotypes),
            reference_contigs: self.reference_contigs.clone(),
        }
    }

    /// Builds over an arbitrary sink. The sink is used as handed in;
    /// `ForceBcf` has no effect here since this crate only emits BCF.
    pub fn build<W>(mut self, sink: W) -> Result<(Box<dyn VariantWriter + Send>, Option<Md5Handle>)>
    where
        W: Write + Send + 'static,
    {
        let index_sink = self.index_sink.take();
        self.assemble(Box::new(sink), index_sink)
    }

    /// Builds over a file path. A `.gz` suffix adds gzip compression;
    /// a path that names a text VCF is refused unless `ForceBcf` says
    /// the caller really wants BCF bytes there. With `IndexOnTheFly`
    /// the index goes to `<path>.bci`; failure to create that file
    /// disables indexing and the writer continues.
    pub fn build_path<P: AsRef<Path>>(
        mut self,
        path: P,
    ) -> Result<(Box<dyn VariantWriter + Send>, Option<Md5Handle>)> {
        let path = path.as_ref();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let looks_textual = name.ends_with(".vcf") || name.ends_with(".vcf.gz");
        if looks_textual && !self.is_set(WriterOption::ForceBcf) {
            return Err(WriteError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} names a text VCF; this writer emits BCF", path.display()),
            )));
        }

        let file = File::create(path)?;
        let mut sink: Box<dyn Write + Send> = Box::new(BufWriter::new(file));
        if name.ends_with(".gz") {
            sink = niffler::send::get_writer(
                sink,
                niffler::send::compression::Format::Gzip,
                niffler::Level::Six,
            )
            .map_err(|e| WriteError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        }

        let index_sink = if self.is_set(WriterOption::IndexOnTheFly) && self.index_sink.is_none() {
            let index_path = {
                let mut p = path.as_os_str().to_owned();
                p.push(".bci");
                p
            };
            match File::create(&index_path) {
                Ok(file) => Some(Box::new(BufWriter::new(file)) as Box<dyn Write + Send>),
                Err(e) => {
                    let unavailable = WriteError::IndexerUnavailable(format!(
                        "cannot create {:?}: {}",
                        index_path, e
                    ));
                    warn!("{}; continuing without an index", unavailable);
                    None
                }
            }
        } else {
            self.index_sink.take()
        };

        self.assemble(sink, index_sink)
    }

    fn assemble(
        mut self,
        sink: Box<dyn Write + Send>,
        index_sink: Option<Box<dyn Write + Send>>,
    ) -> Result<(Box<dyn VariantWriter + Send>, Option<Md5Handle>)> {
        let (sink, md5): (Box<dyn Write + Send>, Option<Md5Handle>) =
            if self.is_set(WriterOption::ComputeMd5) {
                let (tee, handle) = Md5Tee::new(sink);
                (Box::new(tee), Some(handle))
            } else {
                (sink, None)
            };

        let core = BcfWriter::with_config(sink, self.config());

        let indexing = if self.is_set(WriterOption::IndexOnTheFly) {
            match index_sink {
                Some(index_sink) => {
                    let builder = self
                        .index_builder
                        .take()
                        .unwrap_or_else(|| Box::new(OffsetIndexBuilder::new()));
                    IndexingWriter::new(core, builder, index_sink)
                }
                None => {
                    warn!("IndexOnTheFly is set but no index sink is available; indexing disabled");
                    IndexingWriter::disabled(core)
                }
            }
        } else {
            IndexingWriter::disabled(core)
        };

        let mut writer: Box<dyn VariantWriter + Send> = Box::new(indexing);
        if let Some(window) = self.sort_window {
            writer = Box::new(SortingWriter::new(writer, window));
        }
        if self.is_set(WriterOption::UseAsyncIo) {
            writer = Box::new(AsyncWriter::with_capacity(
                writer,
                self.queue_capacity,
                true,
            ));
        }
        Ok((writer, md5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Genotype, VariantRecord};
    use crate::types::{FieldType, Header, HeaderFormat, InfoNumber};

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
        VariantRecord::new("1", start, vec!["A".into(), "G".into()])
            .with_genotypes(vec![Genotype::new("S1", vec![Some(0), Some(1)], false)])
    }

    #[test]
    fn option_strings_roundtrip() {
        use std::str::FromStr;
        for option in [
            WriterOption::IndexOnTheFly,
            WriterOption::DoNotWriteGenotypes,
            WriterOption::AllowMissingFieldsInHeader,
            WriterOption::ForceBcf,
            WriterOption::UseAsyncIo,
            WriterOption::ComputeMd5,
        ] {
            assert_eq!(
                WriterOption::from_str(&option.to_string()).unwrap(),
                option
            );
        }
    }

    #[test]
    fn vcf_paths_are_refused_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.vcf");
        let err = match WriterBuilder::new().build_path(&path) {
            Err(e) => e,
            Ok(_) => panic!("text VCF path was accepted"),
        };
        assert!(matches!(err, WriteError::Io(_)));
        let (mut writer, _) = WriterBuilder::new()
            .option(WriterOption::ForceBcf)
            .build_path(&path)
            .unwrap();
        writer.write_header(&header()).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn md5_digest_is_stable_across_identical_outputs() {
        let write_once = || {
            let (mut writer, md5) = WriterBuilder::new()
                .option(WriterOption::ComputeMd5)
                .build(Vec::new())
                .unwrap();
            writer.write_header(&header()).unwrap();
            writer.add(record(100)).unwrap();
            writer.close().unwrap();
            md5.unwrap().hex()
        };
        let first = write_once();
        let second = write_once();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn sorted_async_stack_accepts_disorder() {
        let (mut writer, _) = WriterBuilder::new()
            .option(WriterOption::UseAsyncIo)
            .sort_window(50)
            .build(Vec::new())
            .unwrap();
        writer.write_header(&header()).unwrap();
        for &start in &[100i64, 140, 110, 130] {
            writer.add(record(start)).unwrap();
        }
        writer.close().unwrap();
    }

    #[test]
    fn missing_index_sink_degrades_to_no_index() {
        // raw sink plus IndexOnTheFly but no index_sink: disabled, not fatal
        let (mut writer, _) = WriterBuilder::new()
            .option(WriterOption::IndexOnTheFly)
            .build(Vec::new())
            .unwrap();
        writer.write_header(&header()).unwrap();
        writer.add(record(100)).unwrap();
        writer.close().unwrap();
    }
}
