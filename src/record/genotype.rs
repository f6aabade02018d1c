use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::dict::Dictionaries;
use crate::record::value::DynValue;
use crate::types::Header;

/// One sample's call: allele indices into the record's allele list
/// (`None` is a no-call slot), the phase flag, the per-sample filter
/// string (FT) and the remaining FORMAT attributes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Genotype {
    pub sample: String,
    pub alleles: Vec<Option<i32>>,
    pub phased: bool,
    pub filters: Option<String>,
    pub attributes: IndexMap<String, DynValue>,
}

impl Genotype {
    pub fn new<S: Into<String>>(sample: S, alleles: Vec<Option<i32>>, phased: bool) -> Self {
        Self {
            sample: sample.into(),
            alleles,
            phased,
            filters: None,
            attributes: IndexMap::new(),
        }
    }

    pub fn ploidy(&self) -> usize {
        self.alleles.len()
    }

    pub fn with_attribute<S: Into<String>, V: Into<DynValue>>(mut self, key: S, value: V) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_filters<S: Into<String>>(mut self, filters: S) -> Self {
        self.filters = Some(filters.into());
        self
    }

    /// The synthesized all-missing call for a sample absent from a
    /// record: no-call alleles at the requested ploidy, no attributes.
    pub fn missing<S: Into<String>>(sample: S, ploidy: usize) -> Self {
        Self {
            sample: sample.into(),
            alleles: vec![None; ploidy],
            phased: false,
            filters: None,
            attributes: IndexMap::new(),
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&DynValue> {
        self.attributes.get(key)
    }
}

/// Structural identity of the header aspects genotype encoding depends
/// on: string dictionary entries in offset order, FORMAT id order, and
/// the sample sequence. Two headers with equal fingerprints assign the
/// same offsets to every FORMAT key and sample slot, so previously
/// encoded genotype bytes remain valid verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeaderFingerprint(u64);

impl HeaderFingerprint {
    pub fn of(header: &Header, dict: &Dictionaries) -> Self {
        let mut hasher = DefaultHasher::new();
        for (name, offset) in dict.strings() {
            name.hash(&mut hasher);
            offset.hash(&mut hasher);
        }
        for format in &header.formats {
            format.id().hash(&mut hasher);
        }
        header.samples.hash(&mut hasher);
        HeaderFingerprint(hasher.finish())
    }
}

/// Previously encoded FORMAT bytes carried through unchanged when the
/// destination header matches the fingerprint they were encoded under.
/// The source header stays attached so a mismatch can be re-expanded
/// against the dictionary the bytes were actually encoded with.
#[derive(Debug, Clone)]
pub struct LazyGenotypes {
    pub bytes: Vec<u8>,
    pub n_format: u8,
    pub source: Arc<Header>,
    pub fingerprint: HeaderFingerprint,
}

impl LazyGenotypes {
    pub fn new(bytes: Vec<u8>, n_format: u8, source: Arc<Header>) -> crate::error::Result<Self> {
        let dict = Dictionaries::from_header(&source, None)?;
        let fingerprint = HeaderFingerprint::of(&source, &dict);
        Ok(Self {
            bytes,
            n_format,
            source,
            fingerprint,
        })
    }
}

impl PartialEq for LazyGenotypes {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
            && self.n_format == other.n_format
            && self.fingerprint == other.fingerprint
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenotypesView {
    Decoded(Vec<Genotype>),
    Lazy(LazyGenotypes),
}

impl GenotypesView {
    pub fn is_lazy(&self) -> bool {
        matches!(self, GenotypesView::Lazy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldType, HeaderFormat, InfoNumber};

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

    #[test]
    fn missing_genotype_is_all_no_call() {
        let g = Genotype::missing("S1", 3);
        assert_eq!(g.ploidy(), 3);
        assert!(g.alleles.iter().all(Option::is_none));
        assert!(!g.phased);
        assert!(g.attributes.is_empty());
    }

    #[test]
    fn fingerprint_tracks_samples_and_formats() {
        let a = header();
        let dict_a = Dictionaries::from_header(&a, None).unwrap();
        let fp_a = HeaderFingerprint::of(&a, &dict_a);

        let same = header();
        let dict_same = Dictionaries::from_header(&same, None).unwrap();
        assert_eq!(fp_a, HeaderFingerprint::of(&same, &dict_same));

        let more_samples = header().with_sample("S2");
        let dict_b = Dictionaries::from_header(&more_samples, None).unwrap();
        assert_ne!(fp_a, HeaderFingerprint::of(&more_samples, &dict_b));
    }
}
