//! Test attributes that fail a test instead of hanging the whole suite.
//!
//! `#[tokio_timeout_test]` runs an async test on its own thread and runtime;
//! `#[timeout]` does the same for synchronous tests. Both accept an optional
//! timeout in seconds (default 60). The async variant also accepts
//! `multi_thread` to run on a multi-threaded runtime:
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test(10, multi_thread)]
//! async fn negotiates() { /* ... */ }
//! ```

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, ItemFn, Lit, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct Options {
    timeout_secs: u64,
    flavor: Flavor,
}

fn parse_options(attr: TokenStream, allow_flavor: bool) -> syn::Result<Options> {
    let mut options = Options {
        timeout_secs: DEFAULT_TIMEOUT_SECS,
        flavor: Flavor::CurrentThread,
    };
    let args = Punctuated::<Expr, Token![,]>::parse_terminated.parse(attr)?;
    for arg in args {
        match &arg {
            Expr::Lit(ExprLit {
                lit: Lit::Int(lit), ..
            }) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                }
                options.timeout_secs = secs;
            }
            Expr::Path(path) if allow_flavor && path.path.is_ident("multi_thread") => {
                options.flavor = Flavor::MultiThread;
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    if allow_flavor {
                        "expected a timeout in seconds or `multi_thread`"
                    } else {
                        "expected a timeout in seconds"
                    },
                ));
            }
        }
    }
    Ok(options)
}

/// Spawns `body` on a fresh thread and waits at most the timeout for it.
fn guarded(timeout_secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_secs(#timeout_secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test timed out after {:?}", timeout_duration)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

fn has_path(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    segments.iter().map(String::as_str).eq(expected.iter().copied())
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr, true) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };
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
        .filter(|attr| !has_path(attr, &["tokio", "test"]) && !has_path(attr, &["test"]))
        .collect();
    let builder = match options.flavor {
        Flavor::CurrentThread => quote! { tokio::runtime::Builder::new_current_thread() },
        Flavor::MultiThread => quote! {
            {
                let mut builder = tokio::runtime::Builder::new_multi_thread();
                builder.worker_threads(4);
                builder
            }
        },
    };
    let timeout_secs = options.timeout_secs;
    let body = guarded(
        timeout_secs,
        quote! {
            let runtime = #builder
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(
                    std::time::Duration::from_secs(#timeout_secs),
                    async move #block,
                )
                .await
                .expect("test timed out");
            });
        },
    );

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr, false) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };
    if sig.asyncness.is_some() {
        return syn::Error::new(
            Span::call_site(),
            "timeout expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !has_path(attr, &["test"]))
        .collect();
    let body = guarded(options.timeout_secs, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}
