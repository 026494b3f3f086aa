// Copyright © 2015 Sebastian Thiel
// Copyright © 2015 Andy Grover
//
// Permission is hereby granted, free of charge, to any person obtaining
// a copy of this software and associated documentation files (the
// “Software”), to deal in the Software without restriction, including
// without limitation the rights to use, copy, modify, merge, publish,
// distribute, sublicense, and/or sell copies of the Software, and to
// permit persons to whom the Software is furnished to do so, subject to
// the following conditions:
//
// The above copyright notice and this permission notice shall be
// included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND,
// EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF
// MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE
// LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION
// OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN CONNECTION
// WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! A lexer and tree builder for LVM2's text metadata format.
//!
//! This is the "export/import" pair the saved-VG buffer uses as its
//! deep-copy mechanism: a VG (or any parsed sub-tree) goes out through
//! [`textmap_to_buf`] and comes back through [`buf_to_textmap`], with no
//! shared state surviving the round trip.

use std::collections::btree_map::BTreeMap;
use std::str::FromStr;

use devicemapper::Device;

use crate::{Error, Result};

#[derive(Debug, PartialEq, Clone)]
pub enum Token<'a> {
    CurlyOpen,
    CurlyClose,
    BracketOpen,
    BracketClose,
    Equals,
    Comma,
    String(&'a [u8]),
    Ident(&'a [u8]),
    Number(i64),
    Comment(&'a [u8]),
    Invalid(u8),
}

pub struct Lexer<'a> {
    chars: &'a [u8],
    next_byte: Option<u8>,
    cursor: usize,
    next_is_ident: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(chars: &'a [u8]) -> Lexer<'a> {
        Lexer {
            chars,
            next_byte: None,
            cursor: 0,
            next_is_ident: false,
        }
    }

    fn put_back(&mut self, c: u8) {
        debug_assert!(self.next_byte.is_none());
        self.next_byte = Some(c);
        self.cursor -= 1;
    }

    fn next_byte(&mut self) -> Option<u8> {
        match self.next_byte.take() {
            Some(c) => {
                self.cursor += 1;
                Some(c)
            }
            None => {
                if self.cursor >= self.chars.len() {
                    None
                } else {
                    let res = self.chars[self.cursor];
                    self.cursor += 1;
                    Some(res)
                }
            }
        }
    }
}

enum Mode {
    Main,
    String(usize),
    Ident(usize),
    Number(usize),
    Comment(usize),
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        let mut state = Mode::Main;

        while let Some(c) = self.next_byte() {
            match state {
                Mode::Main => match c {
                    b'{' => {
                        self.next_is_ident = true;
                        return Some(Token::CurlyOpen);
                    }
                    b'}' => return Some(Token::CurlyClose),
                    b'"' => state = Mode::String(self.cursor - 1),
                    b'a'..=b'z' | b'A'..=b'Z' | b'_' | b'.' => {
                        state = Mode::Ident(self.cursor - 1)
                    }
                    b'0'..=b'9' | b'-' => {
                        if self.next_is_ident {
                            state = Mode::Ident(self.cursor - 1);
                        } else {
                            state = Mode::Number(self.cursor - 1);
                        }
                    }
                    b'#' => state = Mode::Comment(self.cursor - 1),
                    b'[' => return Some(Token::BracketOpen),
                    b']' => return Some(Token::BracketClose),
                    b'=' => return Some(Token::Equals),
                    b',' => return Some(Token::Comma),
                    b' ' | b'\n' | b'\t' | b'\0' => {}
                    _ => return Some(Token::Invalid(c)),
                },
                Mode::String(first) => match c {
                    b'"' => return Some(Token::String(&self.chars[first + 1..self.cursor - 1])),
                    _ => continue,
                },
                Mode::Ident(first) => match c {
                    b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'.' | b'-' => continue,
                    _ => {
                        self.put_back(c);
                        self.next_is_ident = false;
                        return Some(Token::Ident(&self.chars[first..self.cursor]));
                    }
                },
                Mode::Number(first) => match c {
                    b'0'..=b'9' => continue,
                    _ => {
                        self.put_back(c);
                        let s = String::from_utf8_lossy(&self.chars[first..self.cursor]).into_owned();
                        return Some(Token::Number(s.parse().ok()?));
                    }
                },
                Mode::Comment(first) => match c {
                    b'\n' => {
                        self.put_back(c);
                        return Some(Token::Comment(&self.chars[first..self.cursor]));
                    }
                    _ => continue,
                },
            }
        }

        None
    }
}

pub type LvmTextMap = BTreeMap<String, Entry>;

#[derive(Debug, PartialEq, Clone)]
pub enum Entry {
    Number(i64),
    String(String),
    TextMap(Box<LvmTextMap>),
    List(Vec<Entry>),
}

pub trait TextMapOps {
    fn i64_from_textmap(&self, name: &str) -> Option<i64>;
    fn string_from_textmap(&self, name: &str) -> Option<&str>;
    fn textmap_from_textmap(&self, name: &str) -> Option<&LvmTextMap>;
    fn list_from_textmap(&self, name: &str) -> Option<&Vec<Entry>>;
}

impl TextMapOps for LvmTextMap {
    fn i64_from_textmap(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(Entry::Number(x)) => Some(*x),
            _ => None,
        }
    }
    fn string_from_textmap(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(Entry::String(x)) => Some(x),
            _ => None,
        }
    }
    fn textmap_from_textmap(&self, name: &str) -> Option<&LvmTextMap> {
        match self.get(name) {
            Some(Entry::TextMap(x)) => Some(x),
            _ => None,
        }
    }
    fn list_from_textmap(&self, name: &str) -> Option<&Vec<Entry>> {
        match self.get(name) {
            Some(Entry::List(x)) => Some(x),
            _ => None,
        }
    }
}

fn find_matching_token<'a, 'b>(
    tokens: &'b [Token<'a>],
    begin: &Token<'a>,
    end: &Token<'a>,
) -> Result<&'b [Token<'a>]> {
    let mut brace_count = 0;

    for (i, x) in tokens.iter().enumerate() {
        if x == begin {
            brace_count += 1;
        } else if x == end {
            brace_count -= 1;
            if brace_count == 0 {
                return Ok(&tokens[..i + 1]);
            }
        }
    }
    Err(Error::Parse("unmatched brace/bracket".to_string()))
}

// Lists can only contain strings and numbers.
pub fn get_list(tokens: &[Token]) -> Result<Vec<Entry>> {
    let mut v = Vec::new();

    if tokens.first() != Some(&Token::BracketOpen) || tokens.last() != Some(&Token::BracketClose) {
        return Err(Error::Parse("list not bracket-delimited".to_string()));
    }

    for tok in &tokens[1..tokens.len() - 1] {
        match *tok {
            Token::Number(x) => v.push(Entry::Number(x)),
            Token::String(x) => v.push(Entry::String(String::from_utf8_lossy(x).into_owned())),
            Token::Comma => {}
            ref other => return Err(Error::Parse(format!("unexpected {:?} in list", other))),
        }
    }

    Ok(v)
}

fn get_textmap(tokens: &[Token]) -> Result<LvmTextMap> {
    let mut ret: LvmTextMap = BTreeMap::new();

    if tokens.first() != Some(&Token::CurlyOpen) || tokens.last() != Some(&Token::CurlyClose) {
        return Err(Error::Parse("map not brace-delimited".to_string()));
    }

    let mut cur = 1;

    while tokens[cur] != Token::CurlyClose {
        let ident = match tokens[cur] {
            Token::Ident(x) => String::from_utf8_lossy(x).into_owned(),
            Token::Comment(_) => {
                cur += 1;
                continue;
            }
            ref other => {
                return Err(Error::Parse(format!("unexpected {:?} seeking ident", other)))
            }
        };

        cur += 1;
        match tokens[cur] {
            Token::Equals => {
                cur += 1;
                match tokens[cur] {
                    Token::Number(x) => {
                        cur += 1;
                        ret.insert(ident, Entry::Number(x));
                    }
                    Token::String(x) => {
                        cur += 1;
                        ret.insert(ident, Entry::String(String::from_utf8_lossy(x).into_owned()));
                    }
                    Token::BracketOpen => {
                        let slc = find_matching_token(
                            &tokens[cur..],
                            &Token::BracketOpen,
                            &Token::BracketClose,
                        )?;
                        ret.insert(ident, Entry::List(get_list(slc)?));
                        cur += slc.len();
                    }
                    ref other => {
                        return Err(Error::Parse(format!("unexpected {:?} as rvalue", other)))
                    }
                }
            }
            Token::CurlyOpen => {
                let slc = find_matching_token(
                    &tokens[cur..],
                    &Token::CurlyOpen,
                    &Token::CurlyClose,
                )?;
                ret.insert(ident, Entry::TextMap(Box::new(get_textmap(slc)?)));
                cur += slc.len();
            }
            ref other => {
                return Err(Error::Parse(format!("unexpected {:?} after ident", other)))
            }
        };
    }

    Ok(ret)
}

/// Parse a buffer of LVM2 text-format metadata into a tree of [`Entry`]s.
pub fn buf_to_textmap(buf: &[u8]) -> Result<LvmTextMap> {
    let mut tokens: Vec<Token> = Vec::new();

    // The format is implicitly a map at the top level.
    tokens.push(Token::CurlyOpen);
    tokens.extend(&mut Lexer::new(buf));
    tokens.push(Token::CurlyClose);

    get_textmap(&tokens)
}

/// Serialize a tree of [`Entry`]s back into LVM2 text-format bytes.
pub fn textmap_to_buf(tm: &LvmTextMap) -> Vec<u8> {
    let mut vec = Vec::new();

    for (k, v) in tm {
        match v {
            Entry::String(x) => {
                vec.extend(k.as_bytes());
                vec.extend(b" = \"");
                vec.extend(x.as_bytes());
                vec.extend(b"\"\n");
            }
            Entry::Number(x) => {
                vec.extend(k.as_bytes());
                vec.extend(b" = ");
                vec.extend(format!("{}\n", x).as_bytes());
            }
            Entry::List(x) => {
                vec.extend(k.as_bytes());
                vec.extend(b" = [");
                let parts: Vec<_> = x
                    .iter()
                    .map(|e| match e {
                        Entry::String(s) => format!("\"{}\"", s),
                        Entry::Number(n) => format!("{}", n),
                        _ => panic!("lists may only contain strings and numbers"),
                    })
                    .collect();
                vec.extend(parts.join(", ").as_bytes());
                vec.extend(b"]\n");
            }
            Entry::TextMap(x) => {
                vec.extend(k.as_bytes());
                vec.extend(b" {\n");
                vec.extend(textmap_to_buf(x));
                vec.extend(b"}\n");
            }
        };
    }

    vec
}

/// `status` may be serialized as either a bare string or a list of strings.
pub fn status_from_textmap(map: &LvmTextMap) -> Result<Vec<String>> {
    match map.get("status") {
        Some(Entry::String(x)) => Ok(vec![x.clone()]),
        Some(Entry::List(x)) => Ok(x
            .iter()
            .filter_map(|item| match item {
                Entry::String(x) => Some(x.clone()),
                _ => None,
            })
            .collect()),
        _ => Err(Error::Parse("status field missing or malformed".to_string())),
    }
}

pub fn strings_from_textmap(map: &LvmTextMap, name: &str) -> Result<Vec<String>> {
    Ok(map
        .list_from_textmap(name)
        .ok_or_else(|| Error::Parse(format!("{} field missing or malformed", name)))?
        .iter()
        .filter_map(|item| match item {
            Entry::String(x) => Some(x.clone()),
            _ => None,
        })
        .collect())
}

pub fn device_from_textmap(map: &LvmTextMap, name: &str) -> Result<Device> {
    match map.get(name) {
        Some(Entry::String(x)) => Device::from_str(x)
            .map_err(|_| Error::Parse(format!("could not parse device string {:?}", x))),
        Some(Entry::Number(x)) => Ok(Device::from(*x as u64)),
        _ => Err(Error::Parse(format!("{} field missing or malformed", name))),
    }
}
