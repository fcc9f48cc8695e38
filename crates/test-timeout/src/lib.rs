use proc_macro::TokenStream;
use proc_macro2::{Ident, Span, TokenStream as TokenStream2};
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, ExprPath, ItemFn, Lit, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Environment variable that stretches every timeout by an integer factor.
/// Useful on slow CI runners.
const SCALE_ENV: &str = "DESKPILOT_TEST_TIMEOUT_SCALE";

struct TimeoutArgs {
    secs: u64,
    paused: bool,
}

fn parse_args(attr: TokenStream) -> syn::Result<TimeoutArgs> {
    let mut args = TimeoutArgs {
        secs: DEFAULT_TIMEOUT_SECS,
        paused: false,
    };
    if attr.is_empty() {
        return Ok(args);
    }

    let parser = Punctuated::<Expr, Token![,]>::parse_terminated;
    for expr in parser.parse(attr)? {
        match &expr {
            Expr::Lit(ExprLit {
                lit: Lit::Int(lit), ..
            }) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(
                        lit,
                        "timeout must be greater than zero",
                    ));
                }
                args.secs = secs;
            }
            Expr::Path(ExprPath { path, .. }) if path.is_ident("paused") => {
                args.paused = true;
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "expected a timeout in seconds or `paused`",
                ));
            }
        }
    }
    Ok(args)
}

/// Locals introduced around the test body. Mixed-site spans keep them out of
/// reach of the body, so a test may name its own `runtime` or `sender`.
fn local(name: &str) -> Ident {
    Ident::new(name, Span::mixed_site())
}

/// Watchdog shared by both attributes: runs `body` on a fresh thread and
/// fails the test if it does not report back before the deadline.
fn watchdog(secs: u64, body: TokenStream2) -> TokenStream2 {
    let scale = local("timeout_scale");
    let deadline = local("timeout_duration");
    let sender = local("sender");
    let receiver = local("receiver");
    let result = local("result");
    quote! {
        let #scale: u32 = std::env::var(#SCALE_ENV)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .filter(|scale: &u32| *scale > 0)
            .unwrap_or(1);
        let #deadline = std::time::Duration::from_secs(#secs) * #scale;
        let (#sender, #receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let #result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #body));
            let _ = #sender.send(#result);
        });
        match #receiver.recv_timeout(#deadline) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

/// Runs an async test on a current-thread Tokio runtime under a wall-clock
/// deadline. `#[tokio_timeout_test(paused)]` starts the runtime with a
/// paused clock; the deadline is then enforced only in real time so virtual
/// sleeps never trip it.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr) {
        Ok(args) => args,
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

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_path(attr, &["tokio", "test"]))
        .collect();

    let secs = args.secs;
    let runtime = if args.paused {
        quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .expect("failed to build Tokio runtime")
        }
    } else {
        quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime")
        }
    };
    let rt = local("runtime");
    let deadline = local("timeout_duration");
    let drive = if args.paused {
        quote! { #rt.block_on(async move #block) }
    } else {
        quote! {
            #rt.block_on(async {
                tokio::time::timeout(#deadline, async move #block)
                    .await
                    .expect("test timed out")
            })
        }
    };
    let body = watchdog(
        secs,
        quote! {{
            let #rt = #runtime;
            #drive
        }},
    );

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            #body
        }
    })
}

/// Runs a synchronous test on its own thread under a wall-clock deadline.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    if args.paused {
        return syn::Error::new(
            proc_macro2::Span::call_site(),
            "`paused` only applies to tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

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
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_path(attr, &["test"]))
        .collect();

    let body = watchdog(args.secs, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            #body
        }
    })
}

fn is_path(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<_> = attr.path().segments.iter().collect();
    segments.len() == expected.len()
        && segments
            .iter()
            .zip(expected)
            .all(|(segment, want)| segment.ident == want)
}
