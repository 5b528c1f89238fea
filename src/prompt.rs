//! Prompt construction shared by all adapters

use crate::request::CanonicalRequest;

/// System instruction sent alongside every question.
pub const SYSTEM_PROMPT: &str = "You are an expert debugging assistant embedded in a code editor. \
Explain the root cause of the error concisely, reference the code the user shared, \
and suggest a concrete fix. Prefer short answers with code snippets where helpful.";

const TEMPLATE: &str = "I'm getting a {errorType} in {filePath}.

Error message:
{errorMessage}

Relevant code:
```
{codeContext}
```

Question: {question}";

/// Fill the fixed template. Substitution is literal: placeholders that
/// appear inside the substituted values are left untouched.
pub fn build_prompt(request: &CanonicalRequest) -> String
{   let fields: [(&str, &str); 5] = [
      ("{errorType}", request.error_type.as_str())
    , ("{filePath}", request.file_path.as_str())
    , ("{errorMessage}", request.error_message.as_str())
    , ("{codeContext}", request.code_context.as_str())
    , ("{question}", request.question.as_str())
    ];

    let mut out = String::with_capacity(TEMPLATE.len() + 256);
    let mut rest = TEMPLATE;
    while let Some(start) = rest.find('{')
    {   out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match fields.iter().find(|(name, _)| tail.starts_with(name))
        {   Some((name, value)) => {
              out.push_str(value);
              rest = &tail[name.len()..];
            }
          , None => {
              out.push('{');
              rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Rough token count used when a backend reports none: `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> u32
{   let chars = text.chars().count() as u32;
    chars.div_ceil(4)
}
