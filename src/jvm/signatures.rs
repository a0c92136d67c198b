//! Generic signatures and class name rewriting in type strings
//!
//! Signatures ([grammar][0]) are the `Signature` attribute payloads that carry generic type
//! information. The JVM never validates them, which makes them a favourite place for obfuscators
//! to put garbage that crashes decompilers. Parsing one here both validates it and re-renders it
//! with class names optionally rewritten.
//!
//! [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.7.9.1

use std::io::{Error, ErrorKind, Result};
use std::iter::Peekable;
use std::str::Chars;

/// Where the signature was found, which decides which grammar rule it must match
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SignatureKind {
    Class,
    Method,
    Field,
}

/// Check that a signature is well-formed
pub fn validate_signature(signature: &str, kind: SignatureKind) -> bool {
    remap_signature(signature, kind, &|_: &str| None).is_ok()
}

/// Re-render a signature, replacing class names for which `map` returns a new name
pub fn remap_signature(
    signature: &str,
    kind: SignatureKind,
    map: &dyn Fn(&str) -> Option<String>,
) -> Result<String> {
    let mut parser = SignatureParser {
        source: signature.chars().peekable(),
        output: String::with_capacity(signature.len()),
        map,
    };
    match kind {
        SignatureKind::Class => parser.class_signature()?,
        SignatureKind::Method => parser.method_signature()?,
        SignatureKind::Field => parser.reference_type()?,
    }
    match parser.source.next() {
        None => Ok(parser.output),
        Some(c) => Err(invalid(format!("Unexpected leftover input '{}'", c))),
    }
}

/// Replace class names inside a field or method descriptor
///
/// The descriptor is assumed to be well-formed: every `L` starts an object type.
pub fn remap_descriptor(descriptor: &str, map: &dyn Fn(&str) -> Option<String>) -> String {
    let mut output = String::with_capacity(descriptor.len());
    let mut chars = descriptor.chars();
    while let Some(c) = chars.next() {
        output.push(c);
        if c == 'L' {
            let name: String = chars.by_ref().take_while(|c| *c != ';').collect();
            output.push_str(&map(&name).unwrap_or(name));
            output.push(';');
        }
    }
    output
}

/// Replace a class name as found in a `CONSTANT_Class_info` (arrays use descriptor syntax)
pub fn remap_class_name(name: &str, map: &dyn Fn(&str) -> Option<String>) -> String {
    if name.starts_with('[') {
        remap_descriptor(name, map)
    } else {
        map(name).unwrap_or_else(|| name.to_owned())
    }
}

fn invalid(msg: String) -> Error {
    Error::new(ErrorKind::InvalidInput, msg)
}

struct SignatureParser<'a, 'm> {
    source: Peekable<Chars<'a>>,
    output: String,
    map: &'m dyn Fn(&str) -> Option<String>,
}

impl<'a, 'm> SignatureParser<'a, 'm> {
    fn expect(&mut self, expected: char) -> Result<()> {
        match self.source.next() {
            Some(c) if c == expected => {
                self.output.push(c);
                Ok(())
            }
            Some(c) => Err(invalid(format!("Expected '{}' but found '{}'", expected, c))),
            None => Err(Error::new(
                ErrorKind::UnexpectedEof,
                format!("Expected '{}'", expected),
            )),
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.source.peek().copied()
    }

    /// Identifiers exclude `.;[/<>:`
    fn identifier(&mut self) -> Result<String> {
        let mut identifier = String::new();
        while let Some(c) = self.peek() {
            if matches!(c, '.' | ';' | '[' | '/' | '<' | '>' | ':') {
                break;
            }
            identifier.push(c);
            self.source.next();
        }
        if identifier.is_empty() {
            return Err(invalid(String::from("Empty identifier")));
        }
        Ok(identifier)
    }

    fn class_signature(&mut self) -> Result<()> {
        if self.peek() == Some('<') {
            self.type_parameters()?;
        }
        self.class_type()?;
        while self.peek().is_some() {
            self.class_type()?;
        }
        Ok(())
    }

    fn method_signature(&mut self) -> Result<()> {
        if self.peek() == Some('<') {
            self.type_parameters()?;
        }
        self.expect('(')?;
        while self.peek() != Some(')') {
            self.java_type()?;
        }
        self.expect(')')?;
        if self.peek() == Some('V') {
            self.expect('V')?;
        } else {
            self.java_type()?;
        }
        while self.peek() == Some('^') {
            self.expect('^')?;
            match self.peek() {
                Some('T') => self.type_variable()?,
                _ => self.class_type()?,
            }
        }
        Ok(())
    }

    fn type_parameters(&mut self) -> Result<()> {
        self.expect('<')?;
        loop {
            let name = self.identifier()?;
            self.output.push_str(&name);

            // Class bound (may be empty), then any number of interface bounds
            self.expect(':')?;
            if !matches!(self.peek(), Some(':') | Some('>')) {
                self.reference_type()?;
            }
            while self.peek() == Some(':') {
                self.expect(':')?;
                self.reference_type()?;
            }
            if self.peek() == Some('>') {
                break;
            }
        }
        self.expect('>')
    }

    fn java_type(&mut self) -> Result<()> {
        match self.peek() {
            Some(c @ ('B' | 'C' | 'D' | 'F' | 'I' | 'J' | 'S' | 'Z')) => self.expect(c),
            _ => self.reference_type(),
        }
    }

    fn reference_type(&mut self) -> Result<()> {
        match self.peek() {
            Some('L') => self.class_type(),
            Some('T') => self.type_variable(),
            Some('[') => {
                self.expect('[')?;
                self.java_type()
            }
            Some(c) => Err(invalid(format!("Invalid reference type character '{}'", c))),
            None => Err(Error::new(
                ErrorKind::UnexpectedEof,
                "Missing reference type",
            )),
        }
    }

    fn type_variable(&mut self) -> Result<()> {
        self.expect('T')?;
        let name = self.identifier()?;
        self.output.push_str(&name);
        self.expect(';')
    }

    fn class_type(&mut self) -> Result<()> {
        self.expect('L')?;

        // Package specifier and outermost class name
        let mut name = self.identifier()?;
        while self.peek() == Some('/') {
            self.source.next();
            name.push('/');
            name.push_str(&self.identifier()?);
        }
        let mapped = (self.map)(&name).unwrap_or(name);
        self.output.push_str(&mapped);
        if self.peek() == Some('<') {
            self.type_arguments()?;
        }

        // Inner classes
        while self.peek() == Some('.') {
            self.expect('.')?;
            let inner = self.identifier()?;
            self.output.push_str(&inner);
            if self.peek() == Some('<') {
                self.type_arguments()?;
            }
        }
        self.expect(';')
    }

    fn type_arguments(&mut self) -> Result<()> {
        self.expect('<')?;
        loop {
            match self.peek() {
                Some('*') => self.expect('*')?,
                Some(c @ ('+' | '-')) => {
                    self.expect(c)?;
                    self.reference_type()?;
                }
                _ => self.reference_type()?,
            }
            if self.peek() == Some('>') {
                break;
            }
        }
        self.expect('>')
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn valid_signatures() {
        assert!(validate_signature(
            "<K:Ljava/lang/Object;V::Ljava/lang/Comparable<TV;>;>Ljava/util/AbstractMap<TK;TV;>;Ljava/io/Serializable;",
            SignatureKind::Class
        ));
        assert!(validate_signature(
            "<T:Ljava/lang/Object;>(Ljava/util/List<+TT;>;[I)TT;^Ljava/io/IOException;",
            SignatureKind::Method
        ));
        assert!(validate_signature(
            "Ljava/util/Map$Entry<Ljava/lang/String;*>;",
            SignatureKind::Field
        ));
        assert!(validate_signature("La/Outer<TT;>.Inner;", SignatureKind::Field));
    }

    #[test]
    fn garbage_signatures() {
        assert!(!validate_signature("", SignatureKind::Field));
        assert!(!validate_signature("I", SignatureKind::Field));
        assert!(!validate_signature("Ljava/util/List<>;", SignatureKind::Field));
        assert!(!validate_signature("(I)", SignatureKind::Method));
        assert!(!validate_signature("Lnope", SignatureKind::Class));
        assert!(!validate_signature("\u{1}\u{2}", SignatureKind::Class));
    }

    #[test]
    fn remapping() {
        let map = |name: &str| match name {
            "a" => Some(String::from("pkg/Class1")),
            _ => None,
        };
        assert_eq!(
            remap_signature("Ljava/util/List<La;>;", SignatureKind::Field, &map).unwrap(),
            "Ljava/util/List<Lpkg/Class1;>;"
        );
        assert_eq!(remap_descriptor("(La;[La;I)La;", &map), "(Lpkg/Class1;[Lpkg/Class1;I)Lpkg/Class1;");
        assert_eq!(remap_class_name("[[La;", &map), "[[Lpkg/Class1;");
        assert_eq!(remap_class_name("a", &map), "pkg/Class1");
        assert_eq!(remap_class_name("b", &map), "b");
    }
}
