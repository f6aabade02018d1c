mod genotype;
mod value;

use indexmap::IndexMap;

pub use genotype::{Genotype, GenotypesView, HeaderFingerprint, LazyGenotypes};
pub use value::DynValue;

use crate::error::{Result, WriteError};
use crate::types::Header;

pub const DEFAULT_PLOIDY: usize = 2;

/// The FILTER column of a record: never evaluated, passed, or a set of
/// applied filter names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filters {
    Unfiltered,
    Pass,
    Named(Vec<String>),
}

impl Default for Filters {
    fn default() -> Self {
        Filters::Unfiltered
    }
}

/// One variant site with its INFO attributes and optional genotypes.
/// `start` and `end` are 1-based inclusive; `alleles[0]` is the
/// reference allele.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VariantRecord {
    pub chrom: String,
    pub start: i64,
    pub end: i64,
    pub id: Option<String>,
    pub alleles: Vec<String>,
    pub qual: Option<f64>,
    pub filters: Filters,
    pub info: IndexMap<String, DynValue>,
    pub genotypes: Option<GenotypesView>,
}

impl VariantRecord {
    pub fn new<S: Into<String>>(chrom: S, start: i64, alleles: Vec<String>) -> Self {
        let ref_len = alleles.first().map(|a| a.len() as i64).unwrap_or(1);
        Self {
            chrom: chrom.into(),
            start,
            end: start + ref_len - 1,
            alleles,
            ..Default::default()
        }
    }

    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_qual(mut self, qual: f64) -> Self {
        self.qual = Some(qual);
        self
    }

    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_info<S: Into<String>, V: Into<DynValue>>(mut self, key: S, value: V) -> Self {
        self.info.insert(key.into(), value.into());
        self
    }

    pub fn with_genotypes(mut self, genotypes: Vec<Genotype>) -> Self {
        self.genotypes = Some(GenotypesView::Decoded(genotypes));
        self
    }

    pub fn with_lazy_genotypes(mut self, lazy: LazyGenotypes) -> Self {
        self.genotypes = Some(GenotypesView::Lazy(lazy));
        self
    }

    pub fn n_alleles(&self) -> usize {
        self.alleles.len()
    }

    /// Largest ploidy across decoded genotypes, floored at `default`.
    pub fn max_ploidy(&self, default: usize) -> usize {
        match &self.genotypes {
            Some(GenotypesView::Decoded(gts)) => gts
                .iter()
                .map(Genotype::ploidy)
                .max()
                .unwrap_or(default)
                .max(default),
            _ => default,
        }
    }

    /// The FORMAT keys this record will emit, in output order: GT first
    /// when any sample carries a call, FT when any sample carries a
    /// per-sample filter, then the remaining attribute keys in header
    /// declaration order, with keys unknown to the header appended last
    /// (the writer decides whether those are fatal).
    pub fn format_keys(&self, header: &Header) -> Vec<String> {
        let genotypes = match &self.genotypes {
            Some(GenotypesView::Decoded(gts)) => gts,
            _ => return Vec::new(),
        };
        let mut keys = Vec::new();
        if genotypes.iter().any(|g| !g.alleles.is_empty()) {
            keys.push("GT".to_owned());
        }
        if genotypes.iter().any(|g| g.filters.is_some()) {
            keys.push("FT".to_owned());
        }
        let mut present: IndexMap<&str, ()> = IndexMap::new();
        for g in genotypes {
            for key in g.attributes.keys() {
                // GT and FT travel on the genotype itself, never as
                // free-form attributes
                if key != "GT" && key != "FT" {
                    present.entry(key.as_str()).or_insert(());
                }
            }
        }
        for format in &header.formats {
            let id = format.id().as_str();
            if id == "GT" || id == "FT" {
                continue;
            }
            if present.shift_remove(id).is_some() {
                keys.push(id.to_owned());
            }
        }
        // whatever is left was never declared
        keys.extend(present.keys().map(|k| (*k).to_owned()));
        keys
    }

    /// Structural sanity checks that do not need a header.
    pub fn validate(&self) -> Result<()> {
        if self.alleles.is_empty() {
            return Err(WriteError::record_shape(
                &self.chrom,
                self.start,
                "record has no alleles",
            ));
        }
        if self.end < self.start {
            return Err(WriteError::record_shape(
                &self.chrom,
                self.start,
                format!("end {} precedes start {}", self.end, self.start),
            ));
        }
        if self.start < 1 {
            return Err(WriteError::record_shape(
                &self.chrom,
                self.start,
                "start is not 1-based",
            ));
        }
        if let Some(GenotypesView::Decoded(gts)) = &self.genotypes {
            for g in gts {
                for allele in g.alleles.iter().flatten() {
                    if *allele < 0 || *allele as usize >= self.alleles.len() {
                        return Err(WriteError::record_shape(
                            &self.chrom,
                            self.start,
                            format!("genotype of {} references allele {}", g.sample, allele),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}
