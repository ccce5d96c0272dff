//! Wall-clock limits for tests that drive the playlist loop.
//!
//! The test body runs on a thread named after the test; the harness thread
//! waits for it with a deadline, so a wedged loop fails the test instead of
//! hanging the run. Both attributes install a `tracing_subscriber` test writer,
//! so crates using them need `tracing-subscriber` (with `env-filter`) as a dev
//! dependency. `RUST_LOG` selects what is shown.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test(5)]
//! async fn answers() { /* ... */ }
//!
//! #[test_timeout::timeout(millis = 500)]
//! fn quick() { /* ... */ }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_SECS: u64 = 60;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    /// `async fn` driven by a current-thread Tokio runtime.
    Tokio,
    Blocking,
}

/// `N` (seconds), `secs = N` or `millis = N`.
struct Limit {
    millis: u64,
}

impl Parse for Limit {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.is_empty() {
            return Ok(Self {
                millis: DEFAULT_SECS * 1000,
            });
        }
        let (unit, lit) = if input.peek(Ident) {
            let unit: Ident = input.parse()?;
            input.parse::<Token![=]>()?;
            (Some(unit), input.parse::<LitInt>()?)
        } else {
            (None, input.parse::<LitInt>()?)
        };
        let value: u64 = lit.base10_parse()?;
        if value == 0 {
            return Err(syn::Error::new_spanned(&lit, "timeout must be greater than zero"));
        }
        let millis = match unit {
            None => value * 1000,
            Some(unit) if unit == "secs" => value * 1000,
            Some(unit) if unit == "millis" => value,
            Some(unit) => {
                return Err(syn::Error::new_spanned(
                    unit,
                    "expected `secs = N` or `millis = N`",
                ))
            }
        };
        Ok(Self { millis })
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let limit = parse_macro_input!(attr as Limit);
    let item = parse_macro_input!(item as ItemFn);
    expand(Flavor::Tokio, limit, item)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let limit = parse_macro_input!(attr as Limit);
    let item = parse_macro_input!(item as ItemFn);
    expand(Flavor::Blocking, limit, item)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(flavor: Flavor, limit: Limit, item: ItemFn) -> syn::Result<TokenStream2> {
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = item;

    match (flavor, sig.asyncness.is_some()) {
        (Flavor::Tokio, false) => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "tokio_timeout_test can only be applied to async functions",
            ))
        }
        (Flavor::Blocking, true) => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "timeout expects a synchronous test function; use tokio_timeout_test",
            ))
        }
        _ => {}
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();
    let millis = limit.millis;
    let thread_name = sig.ident.to_string();

    let run = match flavor {
        Flavor::Tokio => quote! {
            let runtime = ::tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                ::tokio::time::timeout(limit, async move #block)
                    .await
                    .expect("test timed out");
            });
        },
        Flavor::Blocking => quote! { #block },
    };

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = ::std::time::Duration::from_millis(#millis);
            let (sender, receiver) = ::std::sync::mpsc::channel();
            ::std::thread::Builder::new()
                .name(#thread_name.into())
                .spawn(move || {
                    let _ = ::tracing_subscriber::fmt()
                        .with_env_filter(::tracing_subscriber::EnvFilter::from_default_env())
                        .with_test_writer()
                        .try_init();
                    let result = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                        #run
                    }));
                    let _ = sender.send(result);
                })
                .expect("failed to spawn test thread");
            match receiver.recv_timeout(limit) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {:?}", limit)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

/// `#[test]` and `#[tokio::test]` are replaced by the generated `#[test]`.
fn is_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
