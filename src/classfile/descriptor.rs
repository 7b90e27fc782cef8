//! Field and method descriptors.

use super::ClassFileError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
    /// Internal class name, e.g. `java/lang/String`.
    Object(String),
    /// Full array descriptor, e.g. `[[I`.
    Array(String),
}

impl FieldType {
    pub fn slots(&self) -> u16 {
        match self {
            FieldType::Long | FieldType::Double => 2,
            _ => 1,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, FieldType::Object(_) | FieldType::Array(_))
    }

    pub fn descriptor(&self) -> String {
        match self {
            FieldType::Byte => "B".into(),
            FieldType::Char => "C".into(),
            FieldType::Double => "D".into(),
            FieldType::Float => "F".into(),
            FieldType::Int => "I".into(),
            FieldType::Long => "J".into(),
            FieldType::Short => "S".into(),
            FieldType::Boolean => "Z".into(),
            FieldType::Object(name) => format!("L{name};"),
            FieldType::Array(desc) => desc.clone(),
        }
    }

    /// Name used in a `Class` constant: internal name, or the descriptor for arrays.
    pub fn class_constant_name(&self) -> Option<&str> {
        match self {
            FieldType::Object(name) => Some(name),
            FieldType::Array(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn parse(desc: &str) -> Result<Self, ClassFileError> {
        let (ty, rest) = parse_field_type(desc)?;
        if !rest.is_empty() {
            return Err(ClassFileError::InvalidDescriptor(desc.to_string()));
        }
        Ok(ty)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub params: Vec<FieldType>,
    /// `None` for `void`.
    pub ret: Option<FieldType>,
}

impl MethodDescriptor {
    pub fn parse(desc: &str) -> Result<Self, ClassFileError> {
        let invalid = || ClassFileError::InvalidDescriptor(desc.to_string());
        let mut rest = desc.strip_prefix('(').ok_or_else(invalid)?;
        let mut params = Vec::new();
        while !rest.starts_with(')') {
            if rest.is_empty() {
                return Err(invalid());
            }
            let (ty, tail) = parse_field_type(rest).map_err(|_| invalid())?;
            params.push(ty);
            rest = tail;
        }
        let ret = match &rest[1..] {
            "V" => None,
            other => Some(FieldType::parse(other).map_err(|_| invalid())?),
        };
        Ok(Self { params, ret })
    }

    /// Local slots taken by the arguments, not counting `this`.
    pub fn arg_slots(&self) -> u16 {
        self.params.iter().map(FieldType::slots).sum()
    }

    /// Local slot of argument `index` for a method with the given staticness.
    pub fn arg_slot(&self, index: usize, is_static: bool) -> Option<u16> {
        if index >= self.params.len() {
            return None;
        }
        let base: u16 = if is_static { 0 } else { 1 };
        Some(base + self.params[..index].iter().map(FieldType::slots).sum::<u16>())
    }
}

fn parse_field_type(desc: &str) -> Result<(FieldType, &str), ClassFileError> {
    let invalid = || ClassFileError::InvalidDescriptor(desc.to_string());
    let first = desc.as_bytes().first().copied().ok_or_else(invalid)?;
    let rest = &desc[1..];
    let ty = match first {
        b'B' => FieldType::Byte,
        b'C' => FieldType::Char,
        b'D' => FieldType::Double,
        b'F' => FieldType::Float,
        b'I' => FieldType::Int,
        b'J' => FieldType::Long,
        b'S' => FieldType::Short,
        b'Z' => FieldType::Boolean,
        b'L' => {
            let end = rest.find(';').ok_or_else(invalid)?;
            if end == 0 {
                return Err(invalid());
            }
            return Ok((FieldType::Object(rest[..end].to_string()), &rest[end + 1..]));
        }
        b'[' => {
            let dims = desc.bytes().take_while(|&b| b == b'[').count();
            if dims > 255 {
                return Err(invalid());
            }
            let (_, tail) = parse_field_type(&desc[dims..])?;
            let len = desc.len() - tail.len();
            return Ok((FieldType::Array(desc[..len].to_string()), tail));
        }
        _ => return Err(invalid()),
    };
    Ok((ty, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_parameters() {
        let desc = MethodDescriptor::parse("(IJ[Ljava/lang/String;Ljava/util/List;D)Z").unwrap();
        assert_eq!(
            desc.params,
            vec![
                FieldType::Int,
                FieldType::Long,
                FieldType::Array("[Ljava/lang/String;".into()),
                FieldType::Object("java/util/List".into()),
                FieldType::Double,
            ]
        );
        assert_eq!(desc.ret, Some(FieldType::Boolean));
        assert_eq!(desc.arg_slots(), 7);
        assert_eq!(desc.arg_slot(2, false), Some(4));
        assert_eq!(desc.arg_slot(4, true), Some(5));
        assert_eq!(desc.arg_slot(5, true), None);
    }

    #[test]
    fn void_and_empty() {
        let desc = MethodDescriptor::parse("()V").unwrap();
        assert!(desc.params.is_empty());
        assert_eq!(desc.ret, None);
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["", "V", "(I", "(L;)V", "(Q)V", "()", "(I)VV", "()Ljava/lang/Object"] {
            assert!(MethodDescriptor::parse(bad).is_err(), "{bad}");
        }
    }
}
