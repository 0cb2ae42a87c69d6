use std::fmt::Write as _;

/// Widest field a placeholder may ask for. `u64::MAX` has 20 digits.
const MAX_WIDTH: usize = 64;

/// A printf-style filename pattern with exactly one integer conversion,
/// e.g. `frame%04d.jpg` or `out/left%i.raw`. `%%` is a literal percent sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameTemplate {
    prefix: String,
    suffix: String,
    spec: Placeholder,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Placeholder {
    width: usize,
    zero_pad: bool,
    left_align: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("no integer placeholder (e.g. %04d) in {0:?}")]
    NoPlaceholder(String),
    #[error("more than one placeholder in {0:?}")]
    MultiplePlaceholders(String),
    #[error("unsupported conversion %{conv} in {template:?}, expected %d, %i or %u")]
    Unsupported { template: String, conv: char },
    #[error("dangling '%' at end of {0:?}")]
    Dangling(String),
    #[error("field width in {0:?} exceeds {max}", max = MAX_WIDTH)]
    WidthTooLarge(String),
}

impl FilenameTemplate {
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let mut prefix = String::new();
        let mut suffix = String::new();
        let mut spec: Option<Placeholder> = None;
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '%' {
                if spec.is_some() {
                    suffix.push(c);
                } else {
                    prefix.push(c);
                }
                continue;
            }

            let mut placeholder = Placeholder::default();
            // Flags
            while let Some(&flag) = chars.peek() {
                match flag {
                    '0' => placeholder.zero_pad = true,
                    '-' => placeholder.left_align = true,
                    _ => break,
                }
                chars.next();
            }
            // Width
            while let Some(digit) = chars.peek().and_then(|d| d.to_digit(10)) {
                placeholder.width = placeholder.width * 10 + digit as usize;
                if placeholder.width > MAX_WIDTH {
                    return Err(TemplateError::WidthTooLarge(template.into()));
                }
                chars.next();
            }

            match chars.next() {
                Some('%') if placeholder == Placeholder::default() => {
                    if spec.is_some() {
                        suffix.push('%');
                    } else {
                        prefix.push('%');
                    }
                }
                Some('d' | 'i' | 'u') => {
                    if spec.is_some() {
                        return Err(TemplateError::MultiplePlaceholders(template.into()));
                    }
                    spec = Some(placeholder);
                }
                Some(conv) => {
                    return Err(TemplateError::Unsupported {
                        template: template.into(),
                        conv,
                    })
                }
                None => return Err(TemplateError::Dangling(template.into())),
            }
        }

        let spec = spec.ok_or_else(|| TemplateError::NoPlaceholder(template.into()))?;
        Ok(Self {
            prefix,
            suffix,
            spec,
        })
    }

    /// Substitute `seq` into the pattern.
    pub fn render(&self, seq: u64) -> String {
        let Placeholder {
            width,
            zero_pad,
            left_align,
        } = self.spec;
        let mut out = String::with_capacity(self.prefix.len() + self.suffix.len() + width.max(4));
        out.push_str(&self.prefix);
        // Writing into a String cannot fail.
        let _ = if left_align {
            write!(out, "{seq:<width$}")
        } else if zero_pad {
            write!(out, "{seq:0width$}")
        } else {
            write!(out, "{seq:>width$}")
        };
        out.push_str(&self.suffix);
        out
    }
}

impl std::fmt::Display for FilenameTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let escape = |s: &str| s.replace('%', "%%");
        write!(f, "{}%", escape(&self.prefix))?;
        if self.spec.left_align {
            f.write_str("-")?;
        }
        if self.spec.zero_pad {
            f.write_str("0")?;
        }
        if self.spec.width > 0 {
            write!(f, "{}", self.spec.width)?;
        }
        write!(f, "d{}", escape(&self.suffix))
    }
}
