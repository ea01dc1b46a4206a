//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test, `#[test_timeout::tokio_timeout_test]`
//! an async one (run on a two-worker Tokio runtime). Both take an optional limit in seconds.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Body {
    Sync,
    Async,
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, Body::Async).unwrap_or_else(|err| err.to_compile_error().into())
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, Body::Sync).unwrap_or_else(|err| err.to_compile_error().into())
}

fn expand(attr: TokenStream, item: TokenStream, body: Body) -> syn::Result<TokenStream> {
    let limit_secs = parse_limit(attr)?;
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = syn::parse::<ItemFn>(item)?;

    match (body, sig.asyncness.is_some()) {
        (Body::Async, false) => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "tokio_timeout_test expects an async test function",
            ))
        }
        (Body::Sync, true) => {
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
        .filter(|attr| !is_test_marker(attr))
        .collect();

    let run: TokenStream2 = match body {
        Body::Sync => quote! { #block },
        Body::Async => quote! {{
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime")
                .block_on(async move #block)
        }},
    };

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = std::time::Duration::from_secs(#limit_secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #run));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(limit) {
                Ok(Ok(())) => {}
                Ok(Err(panic)) => std::panic::resume_unwind(panic),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s limit", #limit_secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    }
    .into())
}

fn parse_limit(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit = syn::parse::<LitInt>(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new(lit.span(), "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// `#[test]` and `#[tokio::test]` are replaced by the generated `#[test]`.
fn is_test_marker(attr: &Attribute) -> bool {
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
