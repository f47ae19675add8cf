/// How serialized envelopes are joined into a request body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BatchFormat {
    /// A JSON array: `[a,b,c]`.
    #[default]
    JsonArray,
    /// Newline-delimited JSON: one envelope per line.
    LineDelimited,
}

impl BatchFormat {
    /// Returns the line-delimited format if `line_delimited` is set, otherwise the array format.
    pub fn from_line_delimited(line_delimited: bool) -> Self {
        if line_delimited {
            Self::LineDelimited
        } else {
            Self::JsonArray
        }
    }

    /// Returns the `Content-Type` header value for bodies in this format.
    pub fn content_type(self) -> &'static str {
        match self {
            Self::JsonArray => "application/json",
            Self::LineDelimited => "application/x-json-stream",
        }
    }

    /// Joins payloads into a request body.
    ///
    /// An empty batch yields an empty body.
    ///
    /// ```
    /// use courier_protocol::BatchFormat;
    ///
    /// assert_eq!(BatchFormat::JsonArray.join(["{}", "{}"]), "[{},{}]");
    /// assert_eq!(BatchFormat::LineDelimited.join(["{}", "{}"]), "{}\n{}");
    /// assert_eq!(BatchFormat::JsonArray.join(Vec::<&str>::new()), "");
    /// ```
    pub fn join<'a>(self, payloads: impl IntoIterator<Item = &'a str>) -> String {
        let mut body = String::new();

        for (index, payload) in payloads.into_iter().enumerate() {
            if index > 0 {
                body.push_str(self.separator());
            }
            body.push_str(payload);
        }

        match self {
            Self::JsonArray if !body.is_empty() => format!("[{body}]"),
            _ => body,
        }
    }

    /// Returns the length in bytes of the body [`join`](Self::join) would produce.
    pub fn batch_len<'a>(self, payloads: impl IntoIterator<Item = &'a str>) -> usize {
        let mut count = 0;
        let mut len = 0;

        for payload in payloads {
            count += 1;
            len += payload.len();
        }

        if count == 0 {
            return 0;
        }

        let separators = (count - 1) * self.separator().len();
        match self {
            Self::JsonArray => len + separators + 2,
            Self::LineDelimited => len + separators,
        }
    }

    fn separator(self) -> &'static str {
        match self {
            Self::JsonArray => ",",
            Self::LineDelimited => "\n",
        }
    }
}
