use std::fmt;
use std::str::FromStr;

use getset::Getters;
use multimap::MultiMap;
use num_enum_derive::{IntoPrimitive, TryFromPrimitive};
use strum::{Display, EnumString};

pub type Text = Vec<u8>;
pub type InfoKey = usize;
pub type FormatKey = usize;

pub const BCF_MAJOR_VERSION: u8 = 2;
pub const BCF_MINOR_VERSION: u8 = 1;

/// Bit pattern for a missing QUAL (and any missing FLOAT32 value).
/// This is a quiet NaN distinct from the canonical NaN, so `is_nan()`
/// alone does not identify it.
pub const MISSING_FLOAT_BITS: u32 = 0x7F80_0001;
pub const MISSING_INT8: i8 = i8::MIN;
pub const MISSING_INT16: i16 = i16::MIN;
pub const MISSING_INT32: i32 = i32::MIN;
/// Filler byte for the unused tail of a fixed-width string slot.
pub const STRING_FILL: u8 = 0x07;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

/// The BCF2 wire types. The discriminants are the on-disk type codes
/// found in the low nibble of a type descriptor byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum TypeKind {
    Missing = 0,
    Int8 = 1,
    Int16 = 2,
    Int32 = 3,
    Float32 = 5,
    String = 7,
}

impl TypeKind {
    pub fn size_of(self) -> usize {
        match self {
            TypeKind::Missing => 0,
            TypeKind::Int8 => 1,
            TypeKind::Int16 => 2,
            TypeKind::Int32 => 4,
            TypeKind::Float32 => 4,
            TypeKind::String => 1,
        }
    }

    pub fn is_int(self) -> bool {
        matches!(self, TypeKind::Int8 | TypeKind::Int16 | TypeKind::Int32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub kind: TypeKind,
    pub num_elements: usize,
}

/// Declared VCF type of an INFO or FORMAT field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum FieldType {
    Integer,
    Float,
    Flag,
    Character,
    String,
}

/// Declared cardinality of an INFO or FORMAT field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoNumber {
    Count(usize),
    /// `Number=A`, one value per alternate allele.
    AlternateAlleles,
    /// `Number=R`, one value per allele including the reference.
    Alleles,
    /// `Number=G`, one value per possible genotype.
    Genotypes,
    /// `Number=.`, derived from the values themselves.
    Unknown,
}

impl InfoNumber {
    /// The element count implied by this cardinality in the context of a
    /// record, or `None` when only the values can tell.
    pub fn resolve(self, n_alleles: usize, ploidy: usize) -> Option<usize> {
        match self {
            InfoNumber::Count(n) => Some(n),
            InfoNumber::AlternateAlleles => Some(n_alleles.saturating_sub(1)),
            InfoNumber::Alleles => Some(n_alleles),
            InfoNumber::Genotypes => Some(genotype_combinations(n_alleles, ploidy)),
            InfoNumber::Unknown => None,
        }
    }
}

/// Number of distinct unordered genotypes for `n_alleles` alleles at
/// ploidy `p`, i.e. the multiset coefficient C(n + p - 1, p). For
/// diploid samples this is the familiar n(n+1)/2.
pub fn genotype_combinations(n_alleles: usize, ploidy: usize) -> usize {
    let mut count = 1usize;
    for i in 0..ploidy {
        count = count * (n_alleles + i) / (i + 1);
    }
    count
}

impl fmt::Display for InfoNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InfoNumber::Count(n) => write!(f, "{}", n),
            InfoNumber::AlternateAlleles => f.write_str("A"),
            InfoNumber::Alleles => f.write_str("R"),
            InfoNumber::Genotypes => f.write_str("G"),
            InfoNumber::Unknown => f.write_str("."),
        }
    }
}

impl FromStr for InfoNumber {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(InfoNumber::AlternateAlleles),
            "R" => Ok(InfoNumber::Alleles),
            "G" => Ok(InfoNumber::Genotypes),
            "." => Ok(InfoNumber::Unknown),
            n => n
                .parse()
                .map(InfoNumber::Count)
                .map_err(|_| format!("unknown Number value {:?}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct HeaderInfo {
    pub(crate) id: String,
    pub(crate) number: InfoNumber,
    pub(crate) kind: FieldType,
    pub(crate) description: String,
}

impl HeaderInfo {
    pub fn new<S: Into<String>>(id: S, number: InfoNumber, kind: FieldType, description: S) -> Self {
        Self {
            id: id.into(),
            number,
            kind,
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct HeaderFormat {
    pub(crate) id: String,
    pub(crate) number: InfoNumber,
    pub(crate) kind: FieldType,
    pub(crate) description: String,
}

impl HeaderFormat {
    pub fn new<S: Into<String>>(id: S, number: InfoNumber, kind: FieldType, description: S) -> Self {
        Self {
            id: id.into(),
            number,
            kind,
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct HeaderFilter {
    pub(crate) id: String,
    pub(crate) description: String,
}

impl HeaderFilter {
    pub fn new<S: Into<String>>(id: S, description: S) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct HeaderContig {
    pub(crate) id: String,
    pub(crate) length: Option<u64>,
}

impl HeaderContig {
    pub fn new<S: Into<String>>(id: S, length: Option<u64>) -> Self {
        Self {
            id: id.into(),
            length,
        }
    }
}

/// A header metadata line in canonical sort order.
#[derive(Debug, Clone, Copy)]
pub enum MetaLine<'a> {
    Filter(&'a HeaderFilter),
    Info(&'a HeaderInfo),
    Format(&'a HeaderFormat),
    Contig(&'a HeaderContig),
    Other(&'a str, &'a str),
}

/// The declared structure of the output file: FILTER/INFO/FORMAT lines,
/// contigs, samples, plus uninterpreted `##key=value` passthrough lines.
///
/// Line order within each class is declaration order; the canonical
/// sorted order groups the classes so that a reader scanning the
/// rendered text reconstructs the same dictionary offsets the writer
/// used (the implicit IDX convention).
#[derive(Debug, Clone, Default)]
pub struct Header {
    pub meta: MultiMap<String, String>,
    pub filters: Vec<HeaderFilter>,
    pub infos: Vec<HeaderInfo>,
    pub formats: Vec<HeaderFormat>,
    pub contigs: Vec<HeaderContig>,
    pub samples: Vec<String>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contig<S: Into<String>>(mut self, id: S, length: Option<u64>) -> Self {
        self.contigs.push(HeaderContig::new(id.into(), length));
        self
    }

    pub fn with_info(mut self, info: HeaderInfo) -> Self {
        self.infos.push(info);
        self
    }

    pub fn with_format(mut self, format: HeaderFormat) -> Self {
        self.formats.push(format);
        self
    }

    pub fn with_filter(mut self, filter: HeaderFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_sample<S: Into<String>>(mut self, sample: S) -> Self {
        self.samples.push(sample.into());
        self
    }

    pub fn info(&self, id: &str) -> Option<&HeaderInfo> {
        self.infos.iter().find(|i| i.id == id)
    }

    pub fn format(&self, id: &str) -> Option<&HeaderFormat> {
        self.formats.iter().find(|f| f.id == id)
    }

    pub fn has_filter(&self, id: &str) -> bool {
        id == "PASS" || self.filters.iter().any(|f| f.id == id)
    }

    pub fn sample_index(&self, name: &str) -> Option<usize> {
        self.samples.iter().position(|s| s == name)
    }

    /// Metadata lines in canonical sorted order: FILTER, INFO, FORMAT,
    /// contig, then passthrough lines. The sort is stable within each
    /// class. `fileformat` is excluded; it is always rendered first.
    pub fn sorted_metadata(&self) -> Vec<MetaLine> {
        let mut lines = Vec::with_capacity(
            self.filters.len() + self.infos.len() + self.formats.len() + self.contigs.len(),
        );
        lines.extend(self.filters.iter().map(MetaLine::Filter));
        lines.extend(self.infos.iter().map(MetaLine::Info));
        lines.extend(self.formats.iter().map(MetaLine::Format));
        lines.extend(self.contigs.iter().map(MetaLine::Contig));
        lines.extend(
            self.meta
                .iter_all()
                .filter(|(k, _)| k.as_str() != "fileformat")
                .flat_map(|(k, vs)| vs.iter().map(move |v| MetaLine::Other(k.as_str(), v.as_str()))),
        );
        lines
    }

    pub fn fileformat(&self) -> &str {
        self.meta
            .get("fileformat")
            .map(String::as_str)
            .unwrap_or("VCFv4.2")
    }

    /// Renders the textual VCF header exactly as it is stored in the
    /// BCF header block, without the trailing NUL.
    pub fn to_vcf_text(&self) -> String {
        let mut out = String::new();
        out.push_str("##fileformat=");
        out.push_str(self.fileformat());
        out.push('\n');
        for line in self.sorted_metadata() {
            match line {
                MetaLine::Filter(f) => {
                    out.push_str(&format!(
                        "##FILTER=<ID={},Description=\"{}\">\n",
                        f.id, f.description
                    ));
                }
                MetaLine::Info(i) => {
                    out.push_str(&format!(
                        "##INFO=<ID={},Number={},Type={},Description=\"{}\">\n",
                        i.id, i.number, i.kind, i.description
                    ));
                }
                MetaLine::Format(f) => {
                    out.push_str(&format!(
                        "##FORMAT=<ID={},Number={},Type={},Description=\"{}\">\n",
                        f.id, f.number, f.kind, f.description
                    ));
                }
                MetaLine::Contig(c) => match c.length {
                    Some(len) => out.push_str(&format!("##contig=<ID={},length={}>\n", c.id, len)),
                    None => out.push_str(&format!("##contig=<ID={}>\n", c.id)),
                },
                MetaLine::Other(k, v) => {
                    out.push_str(&format!("##{}={}\n", k, v));
                }
            }
        }
        out.push_str("#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO");
        if !self.samples.is_empty() {
            out.push_str("\tFORMAT");
            for sample in &self.samples {
                out.push('\t');
                out.push_str(sample);
            }
        }
        out.push('\n');
        out
    }
}

/// A decoded vector of values from a single INFO or FORMAT slot,
/// as read back off the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedVec {
    Missing,
    Int32(Vec<i32>),
    Float32(Vec<f32>),
    UString(Vec<u8>),
}

impl TypedVec {
    pub fn num_elements(&self) -> usize {
        match self {
            TypedVec::Missing => 0,
            TypedVec::Int32(v) => v.len(),
            TypedVec::Float32(v) => v.len(),
            TypedVec::UString(v) => v.len(),
        }
    }
}
