use std::collections::HashSet;

use indexmap::IndexMap;
use itertools::Itertools;
use log::debug;

use crate::error::{Result, WriteError};
use crate::types::{Header, HeaderContig};

/// The frozen string and contig dictionaries derived from a header.
///
/// String offsets follow the canonical metadata order: the implicit
/// `PASS` entry first, then FILTER, INFO and FORMAT ids as they appear
/// in the sorted header. A name declared in more than one class (DP as
/// both INFO and FORMAT is the classic case) occupies a single offset.
/// Offsets never change for the lifetime of the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dictionaries {
    strings: IndexMap<String, usize>,
    contigs: IndexMap<String, usize>,
}

impl Dictionaries {
    /// Builds both dictionaries. `reference` supplies contig lines to
    /// synthesize when the header declares none (permissive
    /// configurations only; the builder wires it through).
    pub fn from_header(header: &Header, reference: Option<&[HeaderContig]>) -> Result<Self> {
        let mut strings: IndexMap<String, usize> = IndexMap::new();
        strings.insert("PASS".to_owned(), 0);

        let mut intern = |class: &str, id: &str, seen: &mut HashSet<String>| -> Result<()> {
            if !seen.insert(id.to_owned()) {
                return Err(WriteError::header_shape(
                    class,
                    format!("duplicate id {:?}", id),
                ));
            }
            let next = strings.len();
            strings.entry(id.to_owned()).or_insert(next);
            Ok(())
        };

        let mut seen = HashSet::new();
        for filter in &header.filters {
            if filter.id() == "PASS" {
                continue;
            }
            intern("FILTER", filter.id(), &mut seen)?;
        }
        seen.clear();
        for info in &header.infos {
            intern("INFO", info.id(), &mut seen)?;
        }
        seen.clear();
        for format in &header.formats {
            intern("FORMAT", format.id(), &mut seen)?;
        }

        let declared: &[HeaderContig] = if header.contigs.is_empty() {
            match reference {
                Some(reference) => {
                    debug!(
                        "header has no contig lines, synthesizing {} from the reference dictionary",
                        reference.len()
                    );
                    reference
                }
                None => &[],
            }
        } else {
            &header.contigs
        };
        let mut contigs: IndexMap<String, usize> = IndexMap::new();
        for contig in declared {
            let next = contigs.len();
            if contigs.insert(contig.id().clone(), next).is_some() {
                return Err(WriteError::header_shape(
                    "contig",
                    format!("duplicate id {:?}", contig.id()),
                ));
            }
        }

        debug!(
            "dictionaries frozen: {} strings, {} contigs",
            strings.len(),
            contigs.len()
        );
        Ok(Self { strings, contigs })
    }

    pub fn string_offset(&self, name: &str) -> Result<usize> {
        self.strings.get(name).copied().ok_or_else(|| {
            WriteError::header_shape("string dictionary", format!("unknown key {:?}", name))
        })
    }

    pub fn contig_offset(&self, name: &str) -> Result<usize> {
        self.contigs.get(name).copied().ok_or_else(|| {
            WriteError::header_shape("contig dictionary", format!("unknown contig {:?}", name))
        })
    }

    pub fn has_string(&self, name: &str) -> bool {
        self.strings.contains_key(name)
    }

    pub fn strings(&self) -> impl Iterator<Item = (&str, usize)> {
        self.strings.iter().map(|(name, &offset)| (name.as_str(), offset))
    }

    pub fn contig_name(&self, offset: usize) -> Option<&str> {
        self.contigs
            .get_index(offset)
            .map(|(name, _)| name.as_str())
    }

    pub fn string_name(&self, offset: usize) -> Option<&str> {
        self.strings
            .get_index(offset)
            .map(|(name, _)| name.as_str())
    }

    pub fn n_contigs(&self) -> usize {
        self.contigs.len()
    }

    pub fn describe(&self) -> String {
        self.strings.keys().join(",")
    }
}
