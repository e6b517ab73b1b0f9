//! Binding call arguments to and from wire payloads.
//!
//! Arguments are passed as tuples: `(a, b)` for two, `(a,)` for one, `()` for
//! none. Each element becomes one entry in the request's `Parameters`.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tandem_core::{DecodeError, EncodeError, Encoding, Payload};

/// Turns a caller's arguments into wire parameters.
pub trait IntoParams {
    fn into_params(self, encoding: Encoding) -> Result<Vec<Payload>, EncodeError>;
}

/// Rebuilds a handler's arguments from wire parameters.
pub trait FromParams: Sized {
    /// Number of parameters expected on the wire.
    const ARITY: usize;

    /// Rust type names of each parameter, for diagnostics.
    fn type_names() -> Vec<&'static str>;

    fn from_params(params: &[Payload], encoding: Encoding) -> Result<Self, DecodeError>;
}

/// Pre-encoded parameters, sent as-is.
impl IntoParams for Vec<Payload> {
    fn into_params(self, _encoding: Encoding) -> Result<Vec<Payload>, EncodeError> {
        Ok(self)
    }
}

fn arity_mismatch(encoding: Encoding, expected: usize, got: usize) -> DecodeError {
    DecodeError {
        encoding: encoding.name(),
        message: format!("expected {expected} arguments, got {got}"),
    }
}

fn decode_arg<T: DeserializeOwned>(
    encoding: Encoding,
    index: usize,
    payload: &Payload,
) -> Result<T, DecodeError> {
    encoding
        .decode(payload.as_bytes())
        .map_err(|e| DecodeError {
            encoding: e.encoding,
            message: format!("argument {index}: {}", e.message),
        })
}

macro_rules! impl_params {
    ($($name:ident : $idx:tt),*) => {
        impl<$($name: Serialize),*> IntoParams for ($($name,)*) {
            #[allow(unused_variables)]
            fn into_params(self, encoding: Encoding) -> Result<Vec<Payload>, EncodeError> {
                Ok(vec![$(Payload::new(encoding.encode(&self.$idx)?)),*])
            }
        }

        impl<$($name: DeserializeOwned),*> FromParams for ($($name,)*) {
            const ARITY: usize = <[&str]>::len(&[$(stringify!($name)),*]);

            fn type_names() -> Vec<&'static str> {
                vec![$(std::any::type_name::<$name>()),*]
            }

            #[allow(unused_variables)]
            fn from_params(params: &[Payload], encoding: Encoding) -> Result<Self, DecodeError> {
                if params.len() != Self::ARITY {
                    return Err(arity_mismatch(encoding, Self::ARITY, params.len()));
                }
                Ok(($(decode_arg::<$name>(encoding, $idx, &params[$idx])?,)*))
            }
        }
    };
}

impl_params!();
impl_params!(A: 0);
impl_params!(A: 0, B: 1);
impl_params!(A: 0, B: 1, C: 2);
impl_params!(A: 0, B: 1, C: 2, D: 3);
impl_params!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_params!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
impl_params!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
impl_params!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_params_are_one_payload_per_argument() {
        let params = (1i32, 2i32).into_params(Encoding::Json).unwrap();
        assert_eq!(params, vec![Payload::from("1"), Payload::from("2")]);

        let (a, b) = <(i32, i32)>::from_params(&params, Encoding::Json).unwrap();
        assert_eq!((a, b), (1, 2));
    }

    #[test]
    fn arity_is_checked() {
        assert_eq!(<()>::ARITY, 0);
        assert_eq!(<(String, u8, bool)>::ARITY, 3);

        let err = <(i32, i32)>::from_params(&[Payload::from("1")], Encoding::Json).unwrap_err();
        assert!(err.message.contains("expected 2 arguments, got 1"));
    }

    #[test]
    fn bad_argument_names_its_position() {
        let params = [Payload::from("1"), Payload::from("\"two\"")];
        let err = <(i32, i32)>::from_params(&params, Encoding::Json).unwrap_err();
        assert!(err.message.starts_with("argument 1:"), "{}", err.message);
    }

    #[test]
    fn postcard_params() {
        let params = (String::from("hi"), 7u64).into_params(Encoding::Postcard).unwrap();
        let (s, n) = <(String, u64)>::from_params(&params, Encoding::Postcard).unwrap();
        assert_eq!((s.as_str(), n), ("hi", 7));
    }

    #[test]
    fn type_names_are_reported() {
        assert_eq!(<(i32, String)>::type_names(), ["i32", "alloc::string::String"]);
    }
}
