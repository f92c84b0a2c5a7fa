//! `#[tokio_timeout_test]`: an async test on its own current-thread runtime,
//! failed if it runs longer than a wall-clock limit.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test]
//! async fn default_limit() {}
//!
//! #[test_timeout::tokio_timeout_test(timeout = 5, paused)]
//! async fn virtual_clock() {}
//! ```
//!
//! `paused` starts the runtime with tokio's clock paused (requires tokio's
//! `test-util` feature in the caller). Only the wall-clock guard applies then,
//! since virtual time auto-advances.

use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

enum Arg {
    Timeout(LitInt),
    Paused,
}

impl Parse for Arg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            return Ok(Arg::Timeout(input.parse()?));
        }
        let ident: Ident = input.parse()?;
        match ident.to_string().as_str() {
            "paused" => Ok(Arg::Paused),
            "timeout" => {
                input.parse::<Token![=]>()?;
                Ok(Arg::Timeout(input.parse()?))
            }
            other => Err(syn::Error::new(
                ident.span(),
                format!("unknown argument `{other}`; expected `timeout = N` or `paused`"),
            )),
        }
    }
}

struct Args {
    timeout_secs: u64,
    paused: bool,
}

impl Parse for Args {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = Args {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        for arg in Punctuated::<Arg, Token![,]>::parse_terminated(input)? {
            match arg {
                Arg::Paused => args.paused = true,
                Arg::Timeout(lit) => {
                    let secs: u64 = lit.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new(lit.span(), "timeout must be greater than zero"));
                    }
                    args.timeout_secs = secs;
                }
            }
        }
        Ok(args)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let Args {
        timeout_secs,
        paused,
    } = parse_macro_input!(attr as Args);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let builder = if paused {
        quote! { tokio::runtime::Builder::new_current_thread().enable_all().start_paused(true) }
    } else {
        quote! { tokio::runtime::Builder::new_current_thread().enable_all() }
    };
    let body = if paused {
        quote! { runtime.block_on(async move #block) }
    } else {
        quote! {
            runtime.block_on(async {
                tokio::time::timeout(limit, async move #block)
                    .await
                    .expect("test timed out")
            })
        }
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = std::time::Duration::from_secs(#timeout_secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #builder
                        .build()
                        .expect("failed to build Tokio runtime");
                    #body
                }));
                let _ = sender.send(outcome);
            });
            match receiver.recv_timeout(limit) {
                Ok(Ok(output)) => output,
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s", #timeout_secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    })
}

/// `#[test]` and `#[tokio::test]` would register the function twice.
fn is_test_attribute(attr: &Attribute) -> bool {
    let names: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(names.as_slice(), [one] if one == "test")
        || matches!(names.as_slice(), [a, b] if a == "tokio" && b == "test")
}
