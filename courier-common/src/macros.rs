/// Helper macro to implement string based serialization.
///
/// If a type implements `Display` then this automatically
/// implements a serializer for that type that dispatches
/// appropriately.
#[macro_export]
macro_rules! impl_str_ser {
    ($type:ty) => {
        impl $crate::__serde::ser::Serialize for $type {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: $crate::__serde::ser::Serializer,
            {
                serializer.collect_str(self)
            }
        }
    };
}

/// Helper macro to implement string based deserialization.
///
/// If a type implements `FromStr` then this automatically
/// implements a deserializer for that type that dispatches
/// appropriately.
#[macro_export]
macro_rules! impl_str_de {
    ($type:ty, $expectation:expr) => {
        impl<'de> $crate::__serde::de::Deserialize<'de> for $type {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: $crate::__serde::de::Deserializer<'de>,
            {
                struct V;

                impl $crate::__serde::de::Visitor<'_> for V {
                    type Value = $type;

                    fn expecting(
                        &self,
                        formatter: &mut ::std::fmt::Formatter<'_>,
                    ) -> ::std::fmt::Result {
                        formatter.write_str($expectation)
                    }

                    fn visit_str<E>(self, value: &str) -> Result<$type, E>
                    where
                        E: $crate::__serde::de::Error,
                    {
                        value.parse().map_err(|_| {
                            $crate::__serde::de::Error::invalid_value(
                                $crate::__serde::de::Unexpected::Str(value),
                                &self,
                            )
                        })
                    }
                }

                deserializer.deserialize_str(V)
            }
        }
    };
}

/// Helper macro to implement string based serialization and deserialization.
///
/// If a type implements `FromStr` and `Display` then this automatically
/// implements a serializer/deserializer for that type that dispatches
/// appropriately.
#[macro_export]
macro_rules! impl_str_serde {
    ($type:ty, $expectation:expr) => {
        $crate::impl_str_ser!($type);
        $crate::impl_str_de!($type, $expectation);
    };
}

/// Implements `FromStr` and `Display` for a fieldless enum with fixed string names.
///
/// The error type must be a unit struct, it is returned for unknown names.
///
/// ```
/// use courier_common::derive_fromstr_and_display;
///
/// #[derive(Debug, PartialEq)]
/// enum Color { Red, Green }
///
/// #[derive(Debug)]
/// struct UnknownColor;
///
/// derive_fromstr_and_display!(Color, UnknownColor, {
///     Color::Red => "red",
///     Color::Green => "green",
/// });
///
/// assert_eq!("red".parse::<Color>().unwrap(), Color::Red);
/// assert_eq!(Color::Green.to_string(), "green");
/// ```
#[macro_export]
macro_rules! derive_fromstr_and_display {
    ($type:ty, $error:ident, { $($variant:path => $name:literal),+ $(,)? }) => {
        impl $type {
            /// Returns the string representation of this value.
            pub fn as_str(&self) -> &'static str {
                match *self {
                    $($variant => $name,)+
                }
            }
        }

        impl ::std::fmt::Display for $type {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $type {
            type Err = $error;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Ok(match value {
                    $($name => $variant,)+
                    _ => return Err($error),
                })
            }
        }
    };
}
