//! Decoding support: the inverse of the encoder, used to re-expand
//! lazy genotype payloads that no longer match the active header and to
//! verify written files in tests via [`crate::reader::BcfRecords`].

use std::convert::TryFrom;
use std::str::FromStr;
use std::sync::Arc;

use indexmap::IndexMap;
use nom::bytes::complete::{escaped, is_not, tag, take};
use nom::character::complete::none_of;
use nom::combinator::map;
use nom::multi::{many_m_n, separated_list0};
use nom::number::complete::{le_f32, le_i16, le_i32, le_i8, le_u16, le_u24, le_u32, le_u8};
use nom::sequence::{delimited, separated_pair, tuple};
use nom::branch::alt;
use nom::IResult;

use crate::dict::Dictionaries;
use crate::error::{Result, WriteError};
use crate::fields::{GENOTYPE_FILTER_KEY, GENOTYPE_KEY};
use crate::record::{DynValue, Filters, Genotype, VariantRecord};
use crate::types::{
    FieldType, Header, HeaderContig, HeaderFilter, HeaderFormat, HeaderInfo, InfoNumber, Text,
    TypeDescriptor, TypeKind, TypedVec, Version, MISSING_FLOAT_BITS, MISSING_INT16, MISSING_INT32,
    MISSING_INT8, STRING_FILL,
};

fn truncated(what: &str) -> WriteError {
    WriteError::RecordShape(format!("truncated or malformed {}", what))
}

/// Unwraps a nom result, discarding parser internals.
fn finish<'a, T>(what: &str, result: IResult<&'a [u8], T>) -> Result<(&'a [u8], T)> {
    result.map_err(|_| truncated(what))
}

pub(crate) fn bcf_version(input: &[u8]) -> IResult<&[u8], Version> {
    let (input, _magic) = tag(b"BCF")(input)?;
    let (input, major) = le_u8(input)?;
    let (input, minor) = le_u8(input)?;
    Ok((input, Version { major, minor }))
}

pub(crate) fn header_length(input: &[u8]) -> IResult<&[u8], u32> {
    le_u32(input)
}

pub(crate) fn record_length(input: &[u8]) -> IResult<&[u8], (u32, u32)> {
    tuple((le_u32, le_u32))(input)
}

fn read_count(kind: TypeKind, input: &[u8]) -> IResult<&[u8], usize> {
    match kind {
        TypeKind::Int8 => map(le_u8, |v| v as usize)(input),
        TypeKind::Int16 => map(le_u16, |v| v as usize)(input),
        TypeKind::Int32 => map(le_u32, |v| v as usize)(input),
        _ => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        ))),
    }
}

pub(crate) fn type_descriptor(input: &[u8]) -> IResult<&[u8], TypeDescriptor> {
    let (input, descriptor_byte) = le_u8(input)?;
    let kind = TypeKind::try_from(descriptor_byte & 0b1111).map_err(|_| {
        nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Tag))
    })?;
    let inline = ((descriptor_byte >> 4) & 0b1111) as usize;
    if inline < 15 {
        return Ok((
            input,
            TypeDescriptor {
                kind,
                num_elements: inline,
            },
        ));
    }
    // overflow count follows as a typed scalar integer
    let (input, count_descriptor) = type_descriptor(input)?;
    if count_descriptor.num_elements != 1 {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    }
    let (input, num_elements) = read_count(count_descriptor.kind, input)?;
    Ok((input, TypeDescriptor { kind, num_elements }))
}

pub(crate) fn typed_string(input: &[u8]) -> IResult<&[u8], Text> {
    let (input, TypeDescriptor { kind, num_elements }) = type_descriptor(input)?;
    if kind != TypeKind::String && kind != TypeKind::Missing {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        )));
    }
    let (input, string) = take(num_elements)(input)?;
    Ok((input, string.into()))
}

/// A typed scalar integer, sign-extended to i32.
pub(crate) fn typed_int(input: &[u8]) -> IResult<&[u8], i32> {
    let (input, TypeDescriptor { kind, num_elements }) = type_descriptor(input)?;
    if num_elements != 1 {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    }
    raw_int(kind, input)
}

fn raw_int(kind: TypeKind, input: &[u8]) -> IResult<&[u8], i32> {
    match kind {
        TypeKind::Int8 => map(le_i8, widen_i8)(input),
        TypeKind::Int16 => map(le_i16, widen_i16)(input),
        TypeKind::Int32 => le_i32(input),
        _ => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        ))),
    }
}

/// Missing patterns widen to the i32 sentinel so narrow and wide
/// encodings of the same logical value decode identically.
fn widen_i8(v: i8) -> i32 {
    if v == MISSING_INT8 {
        MISSING_INT32
    } else {
        i32::from(v)
    }
}

fn widen_i16(v: i16) -> i32 {
    if v == MISSING_INT16 {
        MISSING_INT32
    } else {
        i32::from(v)
    }
}

/// An integer vector; a typed-missing descriptor yields the empty vec.
pub(crate) fn typed_ints(input: &[u8]) -> IResult<&[u8], Vec<i32>> {
    let (input, TypeDescriptor { kind, num_elements }) = type_descriptor(input)?;
    if kind == TypeKind::Missing || num_elements == 0 {
        return Ok((input, vec![]));
    }
    many_m_n(num_elements, num_elements, move |i| raw_int(kind, i))(input)
}

pub(crate) fn typed_vec_from_descriptor<'a>(
    descriptor: &TypeDescriptor,
    input: &'a [u8],
) -> IResult<&'a [u8], TypedVec> {
    let n = descriptor.num_elements;
    match descriptor.kind {
        TypeKind::Missing => Ok((input, TypedVec::Missing)),
        TypeKind::Int8 => {
            let (input, data) = many_m_n(n, n, map(le_i8, widen_i8))(input)?;
            Ok((input, TypedVec::Int32(data)))
        }
        TypeKind::Int16 => {
            let (input, data) = many_m_n(n, n, map(le_i16, widen_i16))(input)?;
            Ok((input, TypedVec::Int32(data)))
        }
        TypeKind::Int32 => {
            let (input, data) = many_m_n(n, n, le_i32)(input)?;
            Ok((input, TypedVec::Int32(data)))
        }
        TypeKind::Float32 => {
            let (input, data) = many_m_n(n, n, le_f32)(input)?;
            Ok((input, TypedVec::Float32(data)))
        }
        TypeKind::String => {
            let (data, input) = input.split_at(n);
            Ok((input, TypedVec::UString(data.into())))
        }
    }
}

pub(crate) fn typed_vec(input: &[u8]) -> IResult<&[u8], TypedVec> {
    let (input, descriptor) = type_descriptor(input)?;
    typed_vec_from_descriptor(&descriptor, input)
}

fn info_pair(input: &[u8]) -> IResult<&[u8], (usize, TypedVec)> {
    let (input, key_offset) = typed_int(input)?;
    let (input, data) = typed_vec(input)?;
    Ok((input, (key_offset as usize, data)))
}

/// One FORMAT field: key offset, a shared type descriptor, then one
/// value group per sample.
fn genotype_field(n_samples: usize, input: &[u8]) -> IResult<&[u8], (usize, Vec<TypedVec>)> {
    let (input, key_offset) = typed_int(input)?;
    let (input, descriptor) = type_descriptor(input)?;
    let mut input = input;
    let mut per_sample = Vec::with_capacity(n_samples);
    for _ in 0..n_samples {
        let (rest, values) = typed_vec_from_descriptor(&descriptor, input)?;
        input = rest;
        per_sample.push(values);
    }
    Ok((input, (key_offset as usize, per_sample)))
}

fn trim_string_fill(mut bytes: &[u8]) -> &[u8] {
    while let Some((&last, rest)) = bytes.split_last() {
        if last == STRING_FILL {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

fn is_missing_float(value: f32) -> bool {
    value.to_bits() == MISSING_FLOAT_BITS
}

/// Lifts a decoded wire vector into the dynamic value model of the
/// given declared type. `None` means the slot was entirely missing.
fn dyn_value_of(kind: FieldType, data: TypedVec) -> Option<DynValue> {
    match (kind, data) {
        (FieldType::Flag, _) => Some(DynValue::Flag),
        (_, TypedVec::Missing) => None,
        (FieldType::Integer, TypedVec::Int32(mut v)) => {
            while v.last() == Some(&MISSING_INT32) {
                v.pop();
            }
            match v.len() {
                0 => None,
                1 => Some(DynValue::Int(v[0])),
                _ => Some(DynValue::Ints(v)),
            }
        }
        (FieldType::Float, TypedVec::Float32(mut v)) => {
            while v.last().map(|&x| is_missing_float(x)).unwrap_or(false) {
                v.pop();
            }
            match v.len() {
                0 => None,
                1 => Some(DynValue::Float(v[0])),
                _ => Some(DynValue::Floats(v)),
            }
        }
        (FieldType::Float, TypedVec::Int32(v)) => {
            let floats: Vec<f32> = v.iter().map(|&x| x as f32).collect();
            match floats.len() {
                0 => None,
                1 => Some(DynValue::Float(floats[0])),
                _ => Some(DynValue::Floats(floats)),
            }
        }
        (FieldType::String, TypedVec::UString(v)) | (FieldType::Character, TypedVec::UString(v)) => {
            let text = String::from_utf8_lossy(trim_string_fill(&v)).into_owned();
            if text.is_empty() {
                None
            } else if text.contains(',') {
                Some(DynValue::Strs(text.split(',').map(str::to_owned).collect()))
            } else {
                Some(DynValue::Str(text))
            }
        }
        _ => None,
    }
}

/// Decodes one full record frame body (everything after the two length
/// words) back into a [`VariantRecord`].
pub(crate) fn record(
    header: &Arc<Header>,
    dict: &Dictionaries,
    l_shared: u32,
    l_indiv: u32,
    input: &[u8],
) -> Result<VariantRecord> {
    if input.len() < l_shared as usize + l_indiv as usize {
        return Err(truncated("record body"));
    }
    let (input, genotype_input) = input.split_at(l_shared as usize);
    let (input, (chrom_offset, pos, rlen, qual, n_info, n_allele, n_sample, n_fmt)) = finish(
        "site prefix",
        tuple((le_i32, le_i32, le_i32, le_f32, le_i16, le_i16, le_u24, le_u8))(input),
    )?;
    let chrom = dict
        .contig_name(chrom_offset as usize)
        .ok_or_else(|| {
            WriteError::HeaderShape(format!("contig offset {} is not in the dictionary", chrom_offset))
        })?
        .to_owned();

    let (input, id) = finish("id", typed_string(input))?;
    let (input, alleles) = finish(
        "alleles",
        many_m_n(n_allele as usize, n_allele as usize, typed_string)(input),
    )?;
    let (input, filter_offsets) = finish("filters", typed_ints(input))?;
    let (input, info_pairs) = finish(
        "info",
        many_m_n(n_info as usize, n_info as usize, info_pair)(input),
    )?;
    debug_assert!(input.is_empty());
    let _ = input;

    let start = i64::from(pos) + 1;
    let mut record = VariantRecord {
        chrom,
        start,
        end: start + i64::from(rlen) - 1,
        id: match id.as_slice() {
            b"" | b"." => None,
            other => Some(String::from_utf8_lossy(other).into_owned()),
        },
        alleles: alleles
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect(),
        qual: decode_qual(qual),
        filters: decode_filters(&filter_offsets, dict)?,
        info: IndexMap::new(),
        genotypes: None,
    };

    for (offset, data) in info_pairs {
        let key = dict
            .string_name(offset)
            .ok_or_else(|| {
                WriteError::HeaderShape(format!("INFO offset {} is not in the dictionary", offset))
            })?
            .to_owned();
        let declared = header.info(&key).ok_or_else(|| {
            WriteError::header_shape("INFO", format!("{} decoded but not declared", key))
        })?;
        if let Some(value) = dyn_value_of(*declared.kind(), data) {
            record.info.insert(key, value);
        } else {
            record.info.insert(key, DynValue::Null);
        }
    }

    if l_indiv > 0 {
        let genotypes = decode_genotype_fields(
            genotype_input,
            n_fmt as usize,
            n_sample as usize,
            header,
            dict,
        )?;
        record.genotypes = Some(crate::record::GenotypesView::Decoded(genotypes));
    }

    Ok(record)
}

fn decode_qual(qual: f32) -> Option<f64> {
    if is_missing_float(qual) || qual.is_nan() {
        None
    } else {
        Some(f64::from(qual))
    }
}

fn decode_filters(offsets: &[i32], dict: &Dictionaries) -> Result<Filters> {
    if offsets.is_empty() {
        return Ok(Filters::Unfiltered);
    }
    if offsets.len() == 1 && offsets[0] == 0 {
        return Ok(Filters::Pass);
    }
    let mut names = Vec::with_capacity(offsets.len());
    for &offset in offsets {
        let name = dict.string_name(offset as usize).ok_or_else(|| {
            WriteError::HeaderShape(format!("FILTER offset {} is not in the dictionary", offset))
        })?;
        names.push(name.to_owned());
    }
    Ok(Filters::Named(names))
}

/// Decodes a complete FORMAT block into per-sample genotypes in header
/// sample order. This is both the lazy re-encode path and the
/// verification reader's genotype decoder.
pub(crate) fn decode_genotypes(
    bytes: &[u8],
    n_format: usize,
    header: &Header,
    dict: &Dictionaries,
) -> Result<Vec<Genotype>> {
    decode_genotype_fields(bytes, n_format, header.samples.len(), header, dict)
}

fn decode_genotype_fields(
    input: &[u8],
    n_format: usize,
    n_samples: usize,
    header: &Header,
    dict: &Dictionaries,
) -> Result<Vec<Genotype>> {
    let mut genotypes: Vec<Genotype> = header
        .samples
        .iter()
        .take(n_samples)
        .map(|sample| Genotype::new(sample.as_str(), vec![], false))
        .collect();

    let mut rest = input;
    for _ in 0..n_format {
        let (next, (offset, per_sample)) = finish("FORMAT field", genotype_field(n_samples, rest))?;
        rest = next;
        let key = dict
            .string_name(offset)
            .ok_or_else(|| {
                WriteError::HeaderShape(format!("FORMAT offset {} is not in the dictionary", offset))
            })?
            .to_owned();
        match key.as_str() {
            GENOTYPE_KEY => {
                for (genotype, values) in genotypes.iter_mut().zip(&per_sample) {
                    if let TypedVec::Int32(encoded) = values {
                        let mut alleles = Vec::with_capacity(encoded.len());
                        let mut phased = false;
                        for &packed in encoded {
                            if packed == MISSING_INT32 {
                                // padding beyond this sample's ploidy
                                break;
                            }
                            phased = packed & 1 == 1;
                            let allele = (packed >> 1) - 1;
                            alleles.push(if allele < 0 { None } else { Some(allele) });
                        }
                        genotype.alleles = alleles;
                        genotype.phased = phased;
                    }
                }
            }
            GENOTYPE_FILTER_KEY => {
                for (genotype, values) in genotypes.iter_mut().zip(&per_sample) {
                    if let TypedVec::UString(text) = values {
                        let trimmed = trim_string_fill(text);
                        if !trimmed.is_empty() {
                            genotype.filters =
                                Some(String::from_utf8_lossy(trimmed).into_owned());
                        }
                    }
                }
            }
            _ => {
                let declared = header.format(&key).ok_or_else(|| {
                    WriteError::header_shape("FORMAT", format!("{} decoded but not declared", key))
                })?;
                let kind = *declared.kind();
                for (genotype, values) in genotypes.iter_mut().zip(per_sample.into_iter()) {
                    if let Some(value) = dyn_value_of(kind, values) {
                        genotype.attributes.insert(key.clone(), value);
                    }
                }
            }
        }
    }
    Ok(genotypes)
}

// ---------------------------------------------------------------------------
// header text

fn delimited_string(input: &[u8]) -> IResult<&[u8], &[u8]> {
    delimited(
        tag("\""),
        escaped(none_of("\\\""), '\\', alt((tag("\\"), tag("\"")))),
        tag("\""),
    )(input)
}

fn keys_and_values(input: &[u8]) -> IResult<&[u8], Vec<(&str, &str)>> {
    fn key_value(input: &[u8]) -> IResult<&[u8], (&str, &str)> {
        let (input, (key, value)) = separated_pair(
            is_not("<,=\n"),
            tag(b"="),
            alt((delimited_string, is_not(">,=\n"))),
        )(input)?;
        Ok((
            input,
            (
                std::str::from_utf8(key).unwrap_or(""),
                std::str::from_utf8(value).unwrap_or(""),
            ),
        ))
    }
    separated_list0(tag(","), key_value)(input)
}

fn structured_line(value: &str) -> Result<IndexMap<String, String>> {
    let inner = value
        .strip_prefix('<')
        .and_then(|v| v.strip_suffix('>'))
        .ok_or_else(|| WriteError::header_shape("header", format!("malformed line {:?}", value)))?;
    let (_, pairs) = keys_and_values(inner.as_bytes())
        .map_err(|_| WriteError::header_shape("header", format!("malformed line {:?}", value)))?;
    Ok(pairs
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect())
}

fn required<'a>(fields: &'a IndexMap<String, String>, key: &str, line: &str) -> Result<&'a str> {
    fields
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| WriteError::header_shape("header", format!("{} line without {}", line, key)))
}

/// Parses the textual header block back into a [`Header`]; the inverse
/// of [`Header::to_vcf_text`].
pub(crate) fn parse_header_text(text: &str) -> Result<Header> {
    let mut header = Header::new();
    for line in text.trim_end_matches('\u{0}').lines() {
        if let Some(rest) = line.strip_prefix("##") {
            let (key, value) = rest.split_at(rest.find('=').ok_or_else(|| {
                WriteError::header_shape("header", format!("line without '=': {:?}", line))
            })?);
            let value = &value[1..];
            match key {
                "INFO" => {
                    let fields = structured_line(value)?;
                    header.infos.push(HeaderInfo::new(
                        required(&fields, "ID", "INFO")?,
                        InfoNumber::from_str(required(&fields, "Number", "INFO")?)
                            .map_err(|e| WriteError::header_shape("INFO", e))?,
                        FieldType::from_str(required(&fields, "Type", "INFO")?).map_err(|e| {
                            WriteError::header_shape("INFO", e.to_string())
                        })?,
                        fields.get("Description").map(String::as_str).unwrap_or(""),
                    ));
                }
                "FORMAT" => {
                    let fields = structured_line(value)?;
                    header.formats.push(HeaderFormat::new(
                        required(&fields, "ID", "FORMAT")?,
                        InfoNumber::from_str(required(&fields, "Number", "FORMAT")?)
                            .map_err(|e| WriteError::header_shape("FORMAT", e))?,
                        FieldType::from_str(required(&fields, "Type", "FORMAT")?).map_err(|e| {
                            WriteError::header_shape("FORMAT", e.to_string())
                        })?,
                        fields.get("Description").map(String::as_str).unwrap_or(""),
                    ));
                }
                "FILTER" => {
                    let fields = structured_line(value)?;
                    let id = required(&fields, "ID", "FILTER")?;
                    if id != "PASS" {
                        header.filters.push(HeaderFilter::new(
                            id,
                            fields.get("Description").map(String::as_str).unwrap_or(""),
                        ));
                    }
                }
                "contig" => {
                    let fields = structured_line(value)?;
                    header.contigs.push(HeaderContig::new(
                        required(&fields, "ID", "contig")?.to_owned(),
                        fields.get("length").and_then(|l| l.parse().ok()),
                    ));
                }
                _ => header.meta.insert(key.to_owned(), value.to_owned()),
            }
        } else if let Some(rest) = line.strip_prefix("#CHROM") {
            // the leading empty split plus POS..FORMAT
            header.samples = rest.split('\t').skip(9).map(str::to_owned).collect();
        }
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncodeBuffer;

    #[test]
    fn descriptor_roundtrip_including_overflow() {
        let mut buf = EncodeBuffer::new();
        buf.write_type_descriptor(3, TypeKind::Float32);
        buf.write_type_descriptor(300, TypeKind::Int16);
        let bytes = buf.extract_and_reset();
        let (rest, first) = type_descriptor(&bytes).unwrap();
        assert_eq!(
            first,
            TypeDescriptor {
                kind: TypeKind::Float32,
                num_elements: 3
            }
        );
        let (rest, second) = type_descriptor(rest).unwrap();
        assert!(rest.is_empty());
        assert_eq!(
            second,
            TypeDescriptor {
                kind: TypeKind::Int16,
                num_elements: 300
            }
        );
    }

    #[test]
    fn typed_int_widths_decode_to_the_same_value() {
        for &value in &[0i32, 127, -127, 128, 32767, 70_000, -1] {
            let mut buf = EncodeBuffer::new();
            buf.write_typed_int(value);
            let bytes = buf.extract_and_reset();
            let (rest, decoded) = typed_int(&bytes).unwrap();
            assert!(rest.is_empty());
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn narrow_missing_patterns_widen_on_decode() {
        let mut buf = EncodeBuffer::new();
        buf.write_type_descriptor(2, TypeKind::Int8);
        buf.write_raw_int(5, TypeKind::Int8);
        buf.write_raw_int_missing(TypeKind::Int8);
        let bytes = buf.extract_and_reset();
        let (_, values) = typed_ints(&bytes).unwrap();
        assert_eq!(values, vec![5, MISSING_INT32]);
    }

    #[test]
    fn typed_missing_is_an_empty_vector() {
        let mut buf = EncodeBuffer::new();
        buf.write_typed_missing(TypeKind::Int8);
        let bytes = buf.extract_and_reset();
        let (rest, values) = typed_ints(&bytes).unwrap();
        assert!(rest.is_empty());
        assert!(values.is_empty());
    }

    #[test]
    fn string_fill_is_trimmed() {
        assert_eq!(trim_string_fill(b"abc\x07\x07"), b"abc");
        assert_eq!(trim_string_fill(b"\x07"), b"");
        assert_eq!(trim_string_fill(b"a\x07b"), b"a\x07b");
    }

    #[test]
    fn header_text_roundtrip() {
        let header = Header::new()
            .with_filter(HeaderFilter::new("q10", "Quality below 10"))
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
            .with_contig("1", Some(1000))
            .with_contig("MT", None)
            .with_sample("S1")
            .with_sample("S2");
        let parsed = parse_header_text(&header.to_vcf_text()).unwrap();
        assert_eq!(parsed.filters, header.filters);
        assert_eq!(parsed.infos, header.infos);
        assert_eq!(parsed.formats, header.formats);
        assert_eq!(parsed.contigs, header.contigs);
        assert_eq!(parsed.samples, header.samples);
    }

    #[test]
    fn quoted_descriptions_survive_commas() {
        let parsed = parse_header_text(
            "##INFO=<ID=AC,Number=A,Type=Integer,Description=\"Counts, per ALT\">\n#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n",
        )
        .unwrap();
        assert_eq!(parsed.infos.len(), 1);
        assert_eq!(parsed.infos[0].description(), "Counts, per ALT");
    }
}
