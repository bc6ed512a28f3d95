//! Command argument sum type.

use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Text(String),
    Bytes(Bytes),
    Integer(i64),
}

impl Arg {
    pub(crate) fn into_bytes(self) -> Bytes {
        match self {
            Self::Text(s) => Bytes::from(s.into_bytes()),
            Self::Bytes(b) => b,
            Self::Integer(i) => Bytes::from(i.to_string().into_bytes()),
        }
    }
}

/// Converts a Rust value into a command [`Arg`].
pub trait IntoArg {
    fn into_arg(self) -> Arg;
}

impl IntoArg for Arg {
    fn into_arg(self) -> Arg {
        self
    }
}

impl IntoArg for &str {
    fn into_arg(self) -> Arg {
        Arg::Text(self.to_owned())
    }
}

impl IntoArg for String {
    fn into_arg(self) -> Arg {
        Arg::Text(self)
    }
}

impl IntoArg for &String {
    fn into_arg(self) -> Arg {
        Arg::Text(self.clone())
    }
}

impl IntoArg for Bytes {
    fn into_arg(self) -> Arg {
        Arg::Bytes(self)
    }
}

impl IntoArg for Vec<u8> {
    fn into_arg(self) -> Arg {
        Arg::Bytes(Bytes::from(self))
    }
}

impl IntoArg for &[u8] {
    fn into_arg(self) -> Arg {
        Arg::Bytes(Bytes::copy_from_slice(self))
    }
}

macro_rules! impl_into_arg_integer {
    ($($ty:ty),*) => {
        $(
            impl IntoArg for $ty {
                fn into_arg(self) -> Arg {
                    Arg::Integer(self as i64)
                }
            }
        )*
    };
}

impl_into_arg_integer!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_roundtrip() {
        assert_eq!("GET".into_arg(), Arg::Text("GET".to_owned()));
        assert_eq!("k".to_owned().into_arg(), Arg::Text("k".to_owned()));
    }

    #[test]
    fn bytes_roundtrip() {
        let b = Bytes::from_static(b"\xff\x00");
        assert_eq!(b.clone().into_arg(), Arg::Bytes(b));
        assert_eq!(
            (&b"\xff\x00"[..]).into_arg(),
            Arg::Bytes(Bytes::from_static(b"\xff\x00"))
        );
    }

    #[test]
    fn integer_roundtrip() {
        assert_eq!(42i32.into_arg(), Arg::Integer(42));
        assert_eq!((-7i64).into_arg(), Arg::Integer(-7));
    }

    #[test]
    fn into_bytes_formats_integers_as_decimal() {
        assert_eq!(Arg::Integer(-12).into_bytes(), Bytes::from_static(b"-12"));
    }

}
