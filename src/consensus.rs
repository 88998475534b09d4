// Copyright 2021-2022 Farcaster Devs
//
// This library is free software; you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public
// License as published by the Free Software Foundation; either
// version 3 of the License, or (at your option) any later version.
//
// This library is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this library; if not, write to the Free Software
// Foundation, Inc., 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301, USA

//! Strict little-endian encoding used for session snapshots and for fingerprinting payout
//! schedules. Every participant must produce byte-identical encodings for the same data, so
//! nothing in here depends on `serde` or on platform layout.
//!
//! Foreign blockchain types ([`Txid`], [`Script`], [`Amount`], [`PublicKey`]) are encoded with
//! their consensus byte representation, length prefixed when the size is not fixed.

use bitcoin::hashes::Hash;
use bitcoin::{Amount, PublicKey, Script, Txid};
use hex::encode as hex_encode;
use thiserror::Error;

use std::error;
use std::io;
use std::str;

/// Encoding and decoding errors.
#[derive(Error, Debug)]
pub enum Error {
    /// The type tag is not defined.
    #[error("Unknown consensus type")]
    UnknownType,
    /// The magic bytes expected does not match.
    #[error("Incorrect magic bytes")]
    IncorrectMagicBytes,
    /// The encoded data was produced by an unsupported version.
    #[error("Unsupported encoding version {0}")]
    UnsupportedVersion(u16),
    /// And I/O error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// A generic parsing error.
    #[error("Parsing error: {0}")]
    ParseFailed(&'static str),
    /// Any Consensus error not part of this list.
    #[error("Consensus error: {0}")]
    Other(Box<dyn error::Error + Send + Sync>),
}

impl Error {
    /// Creates a new error of type [`Self::Other`] with an arbitrary payload. Useful to carry
    /// lower-level errors.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }

    /// Consumes the `Error`, returning its inner error (if any).
    ///
    /// If this [`enum@Error`] was constructed via [`new`] then this function will return [`Some`],
    /// otherwise it will return [`None`].
    ///
    /// [`new`]: Error::new
    ///
    pub fn into_inner(self) -> Option<Box<dyn error::Error + Send + Sync>> {
        match self {
            Self::Other(error) => Some(error),
            _ => None,
        }
    }
}

/// Data which can be encoded in a consensus-consistent way.
pub trait Encodable {
    /// Encode an object with a well-defined format, should only ever error if the underlying
    /// encoder errors. If successful, returns size of the encoded object in bytes.
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error>;
}

/// Data which can be decoded in a consensus-consistent way.
pub trait Decodable: Sized {
    /// Decode an object with a well-defined format
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, Error>;
}

/// Encode an object into a vector of bytes. The vector can be [`deserialize`]d to retrieve the
/// data.
pub fn serialize<T: Encodable + ?Sized>(data: &T) -> Vec<u8> {
    let mut encoder = Vec::new();
    let len = data
        .consensus_encode(&mut encoder)
        .expect("in-memory writers don't error");
    debug_assert_eq!(len, encoder.len());
    encoder
}

/// Encode an object into a hex-encoded string.
pub fn serialize_hex<T: Encodable + ?Sized>(data: &T) -> String {
    hex_encode(serialize(data))
}

/// Deserialize an object from a vector of bytes, will error if said deserialization doesn't
/// consume the entire vector.
pub fn deserialize<T: Decodable>(data: &[u8]) -> Result<T, Error> {
    let mut decoder = io::Cursor::new(data);
    let rv = Decodable::consensus_decode(&mut decoder)?;
    if decoder.position() as usize == data.len() {
        Ok(rv)
    } else {
        Err(Error::ParseFailed(
            "data not consumed entirely when explicitly deserializing",
        ))
    }
}

macro_rules! impl_int_encoding {
    ($($ty:ty),*) => {
        $(
            impl Encodable for $ty {
                #[inline]
                fn consensus_encode<W: io::Write>(&self, w: &mut W) -> Result<usize, io::Error> {
                    let bytes = self.to_le_bytes();
                    w.write_all(&bytes)?;
                    Ok(bytes.len())
                }
            }

            impl Decodable for $ty {
                #[inline]
                fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, Error> {
                    let mut buffer = [0u8; std::mem::size_of::<$ty>()];
                    d.read_exact(&mut buffer)?;
                    Ok(<$ty>::from_le_bytes(buffer))
                }
            }
        )*
    };
}

impl_int_encoding!(u8, u16, u32, u64, i64);

impl Encodable for bool {
    fn consensus_encode<W: io::Write>(&self, w: &mut W) -> Result<usize, io::Error> {
        (*self as u8).consensus_encode(w)
    }
}

impl Decodable for bool {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, Error> {
        match u8::consensus_decode(d)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::UnknownType),
        }
    }
}

impl<const N: usize> Encodable for [u8; N] {
    #[inline]
    fn consensus_encode<W: io::Write>(&self, w: &mut W) -> Result<usize, io::Error> {
        w.write_all(&self[..])?;
        Ok(N)
    }
}

impl<const N: usize> Decodable for [u8; N] {
    #[inline]
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, Error> {
        let mut buffer = [0u8; N];
        d.read_exact(&mut buffer)?;
        Ok(buffer)
    }
}

// Vectors are prefixed with a u32 length; a distribution transaction may exceed 64KiB.
impl<T> Encodable for Vec<T>
where
    T: Encodable,
{
    fn consensus_encode<W: io::Write>(&self, w: &mut W) -> Result<usize, io::Error> {
        if self.len() > u32::MAX as usize {
            return Err(io::Error::new(io::ErrorKind::Other, "Value is too long"));
        }
        let mut len = (self.len() as u32).consensus_encode(w)?;
        for t in self {
            len += t.consensus_encode(w)?;
        }
        Ok(len)
    }
}

impl<T> Decodable for Vec<T>
where
    T: Decodable,
{
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, Error> {
        let len = u32::consensus_decode(d)?;
        // cap the preallocation, a corrupted length must not allocate gigabytes upfront
        let mut ret = Vec::<T>::with_capacity((len as usize).min(4096));
        for _ in 0..len {
            ret.push(Decodable::consensus_decode(d)?);
        }
        Ok(ret)
    }
}

impl<T> Encodable for Option<T>
where
    T: Encodable,
{
    fn consensus_encode<W: io::Write>(&self, w: &mut W) -> Result<usize, io::Error> {
        match self {
            Some(t) => Ok(1u8.consensus_encode(w)? + t.consensus_encode(w)?),
            None => 0u8.consensus_encode(w),
        }
    }
}

impl<T> Decodable for Option<T>
where
    T: Decodable,
{
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, Error> {
        match u8::consensus_decode(d)? {
            1u8 => Ok(Some(Decodable::consensus_decode(d)?)),
            0u8 => Ok(None),
            _ => Err(Error::UnknownType),
        }
    }
}

impl Encodable for String {
    fn consensus_encode<W: io::Write>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.as_bytes().to_vec().consensus_encode(w)
    }
}

impl Decodable for String {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, Error> {
        let bytes: Vec<u8> = Decodable::consensus_decode(d)?;
        Ok(str::from_utf8(&bytes).map_err(Error::new)?.into())
    }
}

impl Encodable for Txid {
    fn consensus_encode<W: io::Write>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.into_inner().consensus_encode(w)
    }
}

impl Decodable for Txid {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, Error> {
        Ok(Txid::from_inner(Decodable::consensus_decode(d)?))
    }
}

impl Encodable for Script {
    fn consensus_encode<W: io::Write>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.as_bytes().to_vec().consensus_encode(w)
    }
}

impl Decodable for Script {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, Error> {
        let bytes: Vec<u8> = Decodable::consensus_decode(d)?;
        Ok(Script::from(bytes))
    }
}

impl Encodable for Amount {
    fn consensus_encode<W: io::Write>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.as_sat().consensus_encode(w)
    }
}

impl Decodable for Amount {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, Error> {
        Ok(Amount::from_sat(u64::consensus_decode(d)?))
    }
}

impl Encodable for PublicKey {
    fn consensus_encode<W: io::Write>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.to_bytes().consensus_encode(w)
    }
}

impl Decodable for PublicKey {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, Error> {
        let bytes: Vec<u8> = Decodable::consensus_decode(d)?;
        PublicKey::from_slice(&bytes).map_err(Error::new)
    }
}

/// Implements [`strict_encoding::StrictEncode`] and [`strict_encoding::StrictDecode`] on top of
/// the consensus [`Encodable`] and [`Decodable`] implementations.
#[macro_export]
macro_rules! impl_strict_encoding {
    ($thing:ty) => {
        impl ::strict_encoding::StrictEncode for $thing {
            fn strict_encode<E: ::std::io::Write>(
                &self,
                mut e: E,
            ) -> Result<usize, ::strict_encoding::Error> {
                $crate::consensus::Encodable::consensus_encode(self, &mut e)
                    .map_err(::strict_encoding::Error::from)
            }
        }

        impl ::strict_encoding::StrictDecode for $thing {
            fn strict_decode<D: ::std::io::Read>(
                mut d: D,
            ) -> Result<Self, ::strict_encoding::Error> {
                $crate::consensus::Decodable::consensus_decode(&mut d)
                    .map_err(|e| ::strict_encoding::Error::DataIntegrityError(e.to_string()))
            }
        }
    };
}
