//! Class file header parsing
//!
//! Reads just enough of a compiled class to name it and list its members;
//! method bodies and attributes are skipped.

use crate::config::RetryPolicy;
use crate::error::{HotswapError, HotswapResult};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

const MAGIC: u32 = 0xCAFE_BABE;

/// Errors raised while parsing class file bytes
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClassFormatError {
    #[error("bad magic number {0:#010x}")]
    BadMagic(u32),

    /// Fewer bytes than the structure requires; the file may still be
    /// being written
    #[error("class file truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("unknown constant pool tag {tag} at index {index}")]
    BadConstantTag { tag: u8, index: u16 },

    #[error("constant pool index {index} is not a {expected}")]
    BadIndex { index: u16, expected: &'static str },
}

impl ClassFormatError {
    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::Truncated { .. })
    }
}

/// A field or method declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberInfo {
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
}

/// Parsed class file header.
///
/// Names use binary form (`com.example.Foo$Bar`). The raw bytes are kept so
/// the class can be handed to a redefinition backend.
#[derive(Debug, Clone, Serialize)]
pub struct ClassFile {
    pub major_version: u16,
    pub minor_version: u16,
    pub access_flags: u16,
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub fields: Vec<MemberInfo>,
    pub methods: Vec<MemberInfo>,
    #[serde(skip)]
    bytes: Arc<[u8]>,
}

impl ClassFile {
    pub fn parse(bytes: impl Into<Arc<[u8]>>) -> Result<Self, ClassFormatError> {
        let bytes = bytes.into();
        let mut reader = Reader { data: &bytes, pos: 0 };

        let magic = reader.u32()?;
        if magic != MAGIC {
            return Err(ClassFormatError::BadMagic(magic));
        }
        let minor_version = reader.u16()?;
        let major_version = reader.u16()?;

        let pool = ConstantPool::read(&mut reader)?;

        let access_flags = reader.u16()?;
        let name = pool.class_name(reader.u16()?)?;
        let super_index = reader.u16()?;
        let super_name = if super_index == 0 { None } else { Some(pool.class_name(super_index)?) };

        let interface_count = reader.u16()?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            interfaces.push(pool.class_name(reader.u16()?)?);
        }

        let fields = read_members(&mut reader, &pool)?;
        let methods = read_members(&mut reader, &pool)?;
        skip_attributes(&mut reader)?;

        Ok(Self {
            major_version,
            minor_version,
            access_flags,
            name,
            super_name,
            interfaces,
            fields,
            methods,
            bytes: bytes.clone(),
        })
    }

    /// Raw class file bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Simple name without package
    pub fn simple_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    pub fn package(&self) -> Option<&str> {
        self.name.rsplit_once('.').map(|(package, _)| package)
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & 0x0200 != 0
    }
}

/// Read and parse the class file at `path`.
///
/// Missing, empty and truncated files are retried per `retry`, since an IDE
/// or build tool may still be replacing the file when the change is seen.
pub fn read_class_file(path: &Path, retry: &RetryPolicy) -> HotswapResult<ClassFile> {
    let mut attempt = 1;
    loop {
        let result = std::fs::read(path)
            .map_err(|e| HotswapError::io(path, e))
            .and_then(|bytes| ClassFile::parse(bytes).map_err(HotswapError::from));

        match result {
            Err(e) if e.is_transient() && attempt < retry.attempts => {
                trace!("Retrying read of {:?} (attempt {}): {}", path, attempt, e);
                std::thread::sleep(retry.delay);
                attempt += 1;
            }
            other => return other,
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], ClassFormatError> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.data.len());
        let Some(end) = end else {
            return Err(ClassFormatError::Truncated { offset: self.data.len() });
        };
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ClassFormatError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ClassFormatError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ClassFormatError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[derive(Debug, Clone)]
enum Constant {
    Utf8(String),
    Class { name_index: u16 },
    Other,
    // Second slot of a long or double
    Unusable,
}

struct ConstantPool {
    // Index 0 is unused by the format
    entries: Vec<Constant>,
}

impl ConstantPool {
    fn read(reader: &mut Reader<'_>) -> Result<Self, ClassFormatError> {
        let count = reader.u16()?;
        let mut entries = Vec::with_capacity(count as usize);
        entries.push(Constant::Unusable);

        let mut index: u32 = 1;
        while index < u32::from(count) {
            let tag = reader.u8()?;
            let constant = match tag {
                1 => {
                    let len = reader.u16()?;
                    let raw = reader.take(len as usize)?;
                    Constant::Utf8(String::from_utf8_lossy(raw).into_owned())
                }
                7 => Constant::Class { name_index: reader.u16()? },
                // String, MethodType, Module, Package
                8 | 16 | 19 | 20 => {
                    reader.take(2)?;
                    Constant::Other
                }
                // MethodHandle
                15 => {
                    reader.take(3)?;
                    Constant::Other
                }
                // Integer, Float, field/method refs, NameAndType, Dynamic, InvokeDynamic
                3 | 4 | 9 | 10 | 11 | 12 | 17 | 18 => {
                    reader.take(4)?;
                    Constant::Other
                }
                // Long, Double
                5 | 6 => {
                    reader.take(8)?;
                    entries.push(Constant::Other);
                    index += 1;
                    Constant::Unusable
                }
                _ => return Err(ClassFormatError::BadConstantTag { tag, index: index as u16 }),
            };
            entries.push(constant);
            index += 1;
        }

        Ok(Self { entries })
    }

    fn utf8(&self, index: u16) -> Result<&str, ClassFormatError> {
        match self.entries.get(index as usize) {
            Some(Constant::Utf8(value)) => Ok(value),
            _ => Err(ClassFormatError::BadIndex { index, expected: "Utf8" }),
        }
    }

    fn class_name(&self, index: u16) -> Result<String, ClassFormatError> {
        match self.entries.get(index as usize) {
            Some(Constant::Class { name_index }) => Ok(self.utf8(*name_index)?.replace('/', ".")),
            _ => Err(ClassFormatError::BadIndex { index, expected: "Class" }),
        }
    }
}

fn read_members(
    reader: &mut Reader<'_>,
    pool: &ConstantPool,
) -> Result<Vec<MemberInfo>, ClassFormatError> {
    let count = reader.u16()?;
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let access_flags = reader.u16()?;
        let name = pool.utf8(reader.u16()?)?.to_string();
        let descriptor = pool.utf8(reader.u16()?)?.to_string();
        skip_attributes(reader)?;
        members.push(MemberInfo { access_flags, name, descriptor });
    }
    Ok(members)
}

fn skip_attributes(reader: &mut Reader<'_>) -> Result<(), ClassFormatError> {
    let count = reader.u16()?;
    for _ in 0..count {
        reader.u16()?;
        let len = reader.u32()?;
        reader.take(len as usize)?;
    }
    Ok(())
}

/// Minimal class file bytes for tests: one `run()V` method and a long constant
#[cfg(test)]
pub(crate) fn sample_class(internal_name: &str) -> Vec<u8> {
    fn utf8(out: &mut Vec<u8>, value: &str) {
        out.push(1);
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
    }

    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&61u16.to_be_bytes());

    // #1..#4 names, #5-#6 long, #7..#9 member strings
    out.extend_from_slice(&10u16.to_be_bytes());
    utf8(&mut out, internal_name);
    out.extend_from_slice(&[7, 0, 1]);
    utf8(&mut out, "java/lang/Object");
    out.extend_from_slice(&[7, 0, 3]);
    out.push(5);
    out.extend_from_slice(&42u64.to_be_bytes());
    utf8(&mut out, "run");
    utf8(&mut out, "()V");
    utf8(&mut out, "Code");

    out.extend_from_slice(&0x0021u16.to_be_bytes());
    out.extend_from_slice(&2u16.to_be_bytes());
    out.extend_from_slice(&4u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());

    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&0x0001u16.to_be_bytes());
    out.extend_from_slice(&7u16.to_be_bytes());
    out.extend_from_slice(&8u16.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&9u16.to_be_bytes());
    out.extend_from_slice(&2u32.to_be_bytes());
    out.extend_from_slice(&[0, 0]);

    out.extend_from_slice(&0u16.to_be_bytes());
    out
}
