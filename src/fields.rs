use indexmap::IndexMap;

use crate::dict::Dictionaries;
use crate::encoder::{narrowest_for, EncodeBuffer};
use crate::error::{Result, WriteError};
use crate::record::{DynValue, Genotype, VariantRecord};
use crate::types::{FieldType, Header, InfoNumber, TypeKind, MISSING_INT8};

pub const GENOTYPE_KEY: &str = "GT";
pub const GENOTYPE_FILTER_KEY: &str = "FT";

/// FORMAT integer fields with a well-known per-sample shape: scalar
/// depth/quality and the per-allele / per-genotype count vectors.
const INT_ARRAY_KEYS: [&str; 4] = ["DP", "AD", "GQ", "PL"];

/// GT packs `allele_offset + 1` into the upper seven bits of an INT8,
/// which caps the addressable alleles at the inline-descriptor limit.
pub const MAX_GT_ALLELES: usize = 15;

/// How one declared INFO key is emitted into the site block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteEncoder {
    Flag,
    Float,
    AtomicInt,
    GenericInts,
    StringOrChar,
}

/// How one declared FORMAT key is emitted into the genotype block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenotypeEncoder {
    Gt,
    Filter,
    IntArray,
    DynamicInt,
    StaticFloat,
    StringOrChar,
}

#[derive(Debug, Clone)]
pub struct SiteField {
    pub offset: usize,
    pub number: InfoNumber,
    pub kind: FieldType,
    pub encoder: SiteEncoder,
}

#[derive(Debug, Clone)]
pub struct GenotypeField {
    pub offset: usize,
    pub number: InfoNumber,
    pub encoder: GenotypeEncoder,
}

impl SiteField {
    /// The dictionary offset of the key, as a typed scalar int at the
    /// narrowest width the offset itself allows.
    pub fn write_field_key(&self, buf: &mut EncodeBuffer) {
        buf.write_typed_int(self.offset as i32);
    }

    pub fn write_site(
        &self,
        buf: &mut EncodeBuffer,
        record: &VariantRecord,
        key: &str,
        value: &DynValue,
    ) -> Result<()> {
        let type_error = |expected: &str| {
            WriteError::record_shape(
                &record.chrom,
                record.start,
                format!("INFO {} expects {} values, got {:?}", key, expected, value),
            )
        };
        if let DynValue::Null = value {
            buf.write_typed_missing(self.missing_kind());
            return Ok(());
        }
        match self.encoder {
            SiteEncoder::Flag => buf.write_typed_int(1),
            SiteEncoder::Float => {
                let values = value.floats().ok_or_else(|| type_error("float"))?;
                buf.write_typed_floats(&values);
            }
            SiteEncoder::AtomicInt | SiteEncoder::GenericInts => {
                let values = value.ints().ok_or_else(|| type_error("integer"))?;
                buf.write_typed_ints(&values);
            }
            SiteEncoder::StringOrChar => {
                let text = value.text().ok_or_else(|| type_error("string"))?;
                buf.write_typed_string(text.as_bytes());
            }
        }
        Ok(())
    }

    fn missing_kind(&self) -> TypeKind {
        match self.encoder {
            SiteEncoder::Float => TypeKind::Float32,
            SiteEncoder::StringOrChar => TypeKind::String,
            _ => TypeKind::Int8,
        }
    }
}

impl GenotypeField {
    pub fn write_field_key(&self, buf: &mut EncodeBuffer) {
        buf.write_typed_int(self.offset as i32);
    }

    /// Emits this key's column: one type descriptor, then exactly
    /// `values_per_genotype` values for every sample. `genotypes` is
    /// already resolved to header sample order with absent samples
    /// synthesized as all-missing.
    pub fn write_genotypes(
        &self,
        buf: &mut EncodeBuffer,
        record: &VariantRecord,
        key: &str,
        genotypes: &[Genotype],
        max_ploidy: usize,
    ) -> Result<()> {
        match self.encoder {
            GenotypeEncoder::Gt => self.write_gt(buf, record, genotypes, max_ploidy),
            GenotypeEncoder::Filter => self.write_filter_strings(buf, genotypes),
            GenotypeEncoder::IntArray | GenotypeEncoder::DynamicInt => {
                self.write_ints(buf, record, key, genotypes, max_ploidy)
            }
            GenotypeEncoder::StaticFloat => self.write_floats(buf, record, key, genotypes, max_ploidy),
            GenotypeEncoder::StringOrChar => self.write_strings(buf, record, key, genotypes),
        }
    }

    /// GT: one INT8 per chromosome copy, `((allele + 1) << 1) | phase`,
    /// no-call slots encode allele -1 and positions beyond a sample's
    /// ploidy are the INT8 missing pattern.
    fn write_gt(
        &self,
        buf: &mut EncodeBuffer,
        record: &VariantRecord,
        genotypes: &[Genotype],
        max_ploidy: usize,
    ) -> Result<()> {
        if record.n_alleles() > MAX_GT_ALLELES {
            return Err(WriteError::unsupported(
                &record.chrom,
                record.start,
                format!(
                    "{} alleles exceed the GT limit of {}",
                    record.n_alleles(),
                    MAX_GT_ALLELES
                ),
            ));
        }
        buf.write_type_descriptor(max_ploidy, TypeKind::Int8);
        for genotype in genotypes {
            let phase = genotype.phased as u8;
            for slot in 0..max_ploidy {
                match genotype.alleles.get(slot) {
                    Some(Some(allele)) => {
                        buf.write_raw_u8((((allele + 1) as u8) << 1) | phase)
                    }
                    Some(None) => buf.write_raw_u8(phase),
                    None => buf.write_raw_u8(MISSING_INT8 as u8),
                }
            }
        }
        Ok(())
    }

    /// FT: per-sample filter strings in one fixed-width CHAR column.
    fn write_filter_strings(&self, buf: &mut EncodeBuffer, genotypes: &[Genotype]) -> Result<()> {
        let width = genotypes
            .iter()
            .filter_map(|g| g.filters.as_ref().map(String::len))
            .max()
            .unwrap_or(0);
        buf.write_type_descriptor(width, TypeKind::String);
        for genotype in genotypes {
            let text = genotype.filters.as_deref().unwrap_or("");
            buf.write_raw_string(text.as_bytes(), width);
        }
        Ok(())
    }

    fn write_ints(
        &self,
        buf: &mut EncodeBuffer,
        record: &VariantRecord,
        key: &str,
        genotypes: &[Genotype],
        max_ploidy: usize,
    ) -> Result<()> {
        let mut columns: Vec<Option<Vec<i32>>> = Vec::with_capacity(genotypes.len());
        for genotype in genotypes {
            match genotype.attribute(key) {
                None | Some(DynValue::Null) => columns.push(None),
                Some(value) => {
                    let ints = value.ints().ok_or_else(|| {
                        WriteError::record_shape(
                            &record.chrom,
                            record.start,
                            format!(
                                "FORMAT {} of {} expects integer values, got {:?}",
                                key, genotype.sample, value
                            ),
                        )
                    })?;
                    columns.push(Some(ints));
                }
            }
        }
        let count = self.values_per_genotype(
            record,
            key,
            max_ploidy,
            columns.iter().flatten().map(Vec::len),
        )?;

        // first pass: the narrowest width every present value fits
        let kind = narrowest_for(columns.iter().flatten().flatten().copied());

        buf.write_type_descriptor(count, kind);
        for column in &columns {
            match column {
                Some(values) => {
                    for &value in values {
                        buf.write_raw_int(value, kind);
                    }
                    for _ in values.len()..count {
                        buf.write_raw_int_missing(kind);
                    }
                }
                None => {
                    for _ in 0..count {
                        buf.write_raw_int_missing(kind);
                    }
                }
            }
        }
        Ok(())
    }

    fn write_floats(
        &self,
        buf: &mut EncodeBuffer,
        record: &VariantRecord,
        key: &str,
        genotypes: &[Genotype],
        max_ploidy: usize,
    ) -> Result<()> {
        let mut columns: Vec<Option<Vec<f32>>> = Vec::with_capacity(genotypes.len());
        for genotype in genotypes {
            match genotype.attribute(key) {
                None | Some(DynValue::Null) => columns.push(None),
                Some(value) => {
                    let floats = value.floats().ok_or_else(|| {
                        WriteError::record_shape(
                            &record.chrom,
                            record.start,
                            format!(
                                "FORMAT {} of {} expects float values, got {:?}",
                                key, genotype.sample, value
                            ),
                        )
                    })?;
                    columns.push(Some(floats));
                }
            }
        }
        let count = self.values_per_genotype(
            record,
            key,
            max_ploidy,
            columns.iter().flatten().map(Vec::len),
        )?;

        buf.write_type_descriptor(count, TypeKind::Float32);
        for column in &columns {
            match column {
                Some(values) => {
                    for &value in values {
                        buf.write_raw_f32(value);
                    }
                    for _ in values.len()..count {
                        buf.write_raw_f32_missing();
                    }
                }
                None => {
                    for _ in 0..count {
                        buf.write_raw_f32_missing();
                    }
                }
            }
        }
        Ok(())
    }

    fn write_strings(
        &self,
        buf: &mut EncodeBuffer,
        record: &VariantRecord,
        key: &str,
        genotypes: &[Genotype],
    ) -> Result<()> {
        let mut columns: Vec<Option<String>> = Vec::with_capacity(genotypes.len());
        for genotype in genotypes {
            match genotype.attribute(key) {
                None | Some(DynValue::Null) => columns.push(None),
                Some(value) => {
                    let text = value.text().ok_or_else(|| {
                        WriteError::record_shape(
                            &record.chrom,
                            record.start,
                            format!(
                                "FORMAT {} of {} expects string values, got {:?}",
                                key, genotype.sample, value
                            ),
                        )
                    })?;
                    columns.push(Some(text));
                }
            }
        }
        let width = columns
            .iter()
            .flatten()
            .map(String::len)
            .max()
            .unwrap_or(0);
        buf.write_type_descriptor(width, TypeKind::String);
        for column in &columns {
            let text = column.as_deref().unwrap_or("");
            buf.write_raw_string(text.as_bytes(), width);
        }
        Ok(())
    }

    /// The common element count for one key across all samples: fixed
    /// by the header, derived from record context (alleles/ploidy), or
    /// the maximum the values themselves show. These sources are
    /// mutually exclusive per key.
    fn values_per_genotype<I>(
        &self,
        record: &VariantRecord,
        key: &str,
        max_ploidy: usize,
        observed: I,
    ) -> Result<usize>
    where
        I: Iterator<Item = usize>,
    {
        let observed_max = observed.max().unwrap_or(0);
        let count = match self.number.resolve(record.n_alleles(), max_ploidy) {
            Some(count) => count,
            None => observed_max,
        };
        if observed_max > count {
            return Err(WriteError::record_shape(
                &record.chrom,
                record.start,
                format!(
                    "FORMAT {} carries {} values where the header allows {}",
                    key, observed_max, count
                ),
            ));
        }
        Ok(count.max(1))
    }
}

/// One encoder per declared key, chosen at header time and memoized for
/// the writer's lifetime; record-time dispatch is a direct match on the
/// selected variant.
#[derive(Debug, Clone)]
pub struct FieldRegistry {
    site: IndexMap<String, SiteField>,
    genotype: IndexMap<String, GenotypeField>,
}

impl FieldRegistry {
    pub fn from_header(header: &Header, dict: &Dictionaries) -> Result<Self> {
        let mut site = IndexMap::with_capacity(header.infos.len());
        for info in &header.infos {
            let encoder = match (info.kind(), info.number()) {
                (FieldType::Flag, _) => SiteEncoder::Flag,
                (FieldType::Float, _) => SiteEncoder::Float,
                (FieldType::Integer, InfoNumber::Count(1)) => SiteEncoder::AtomicInt,
                (FieldType::Integer, _) => SiteEncoder::GenericInts,
                (FieldType::Character, _) | (FieldType::String, _) => SiteEncoder::StringOrChar,
            };
            site.insert(
                info.id().clone(),
                SiteField {
                    offset: dict.string_offset(info.id())?,
                    number: *info.number(),
                    kind: *info.kind(),
                    encoder,
                },
            );
        }

        let mut genotype = IndexMap::with_capacity(header.formats.len());
        for format in &header.formats {
            let encoder = if format.id() == GENOTYPE_KEY {
                GenotypeEncoder::Gt
            } else if format.id() == GENOTYPE_FILTER_KEY {
                GenotypeEncoder::Filter
            } else {
                match format.kind() {
                    FieldType::Flag => {
                        return Err(WriteError::header_shape(
                            "FORMAT",
                            format!("{} is declared Flag, which FORMAT does not allow", format.id()),
                        ));
                    }
                    FieldType::Integer => {
                        if INT_ARRAY_KEYS.contains(&format.id().as_str()) {
                            GenotypeEncoder::IntArray
                        } else {
                            GenotypeEncoder::DynamicInt
                        }
                    }
                    FieldType::Float => GenotypeEncoder::StaticFloat,
                    FieldType::Character | FieldType::String => GenotypeEncoder::StringOrChar,
                }
            };
            genotype.insert(
                format.id().clone(),
                GenotypeField {
                    offset: dict.string_offset(format.id())?,
                    number: *format.number(),
                    encoder,
                },
            );
        }

        Ok(Self { site, genotype })
    }

    pub fn site(&self, key: &str) -> Option<&SiteField> {
        self.site.get(key)
    }

    pub fn genotype(&self, key: &str) -> Option<&GenotypeField> {
        self.genotype.get(key)
    }
}
