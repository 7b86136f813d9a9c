//! Attribute macros that wire a plain function into nexus's global
//! registry: `#[nexus::test]` and `#[nexus::app]`.
//!
//! These macros do not implement any test semantics themselves; they only
//! perform the signature reflection needed to build a `TestRecord`/
//! `AppRecord` and hand it to `inventory::submit!` so that
//! `nexus::registry::all_tests()`/`all_apps()` can discover it without the
//! user writing any registration boilerplate.

extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Ident, ItemFn, Lit, LitStr, Meta, NestedMeta, Token};

/// Options recognized inside `#[nexus::test(..)]`. Unknown identifiers are a
/// compile error, matching the "options are a closed set" wording of the
/// registry's `configure` operation.
#[derive(Default)]
struct TestOpts {
    exclusive: bool,
    should_fail: bool,
    endless: bool,
    disabled: bool,
    debug: bool,
    verbose: bool,
    seed: Option<u64>,
    before: Option<String>,
    after: Option<String>,
    opt_in_group: Option<String>,
}

struct MetaList(Punctuated<NestedMeta, Token![,]>);

impl Parse for MetaList {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        Ok(MetaList(Punctuated::parse_terminated(input)?))
    }
}

fn lit_str(lit: &Lit, what: &str) -> String {
    match lit {
        Lit::Str(s) => s.value(),
        _ => panic!("nexus: `{}` expects a string literal", what),
    }
}

fn lit_u64(lit: &Lit, what: &str) -> u64 {
    match lit {
        Lit::Int(i) => i.base10_parse().unwrap_or_else(|_| {
            panic!("nexus: `{}` expects an integer literal", what)
        }),
        _ => panic!("nexus: `{}` expects an integer literal", what),
    }
}

fn parse_test_opts(attr: TokenStream) -> TestOpts {
    let mut opts = TestOpts::default();
    if attr.is_empty() {
        return opts;
    }
    let list = parse_macro_input!(attr as MetaList);
    for meta in list.0 {
        match meta {
            NestedMeta::Meta(Meta::Path(p)) => {
                let ident = p.get_ident().map(|i| i.to_string()).unwrap_or_default();
                match ident.as_str() {
                    "exclusive" => opts.exclusive = true,
                    "should_fail" => opts.should_fail = true,
                    "endless" => opts.endless = true,
                    "disabled" => opts.disabled = true,
                    "debug" => opts.debug = true,
                    "verbose" => opts.verbose = true,
                    other => panic!("nexus: unknown test option `{}`", other),
                }
            }
            NestedMeta::Meta(Meta::NameValue(nv)) => {
                let ident = nv.path.get_ident().map(|i| i.to_string()).unwrap_or_default();
                match ident.as_str() {
                    "seed" => opts.seed = Some(lit_u64(&nv.lit, "seed")),
                    "before" => opts.before = Some(lit_str(&nv.lit, "before")),
                    "after" => opts.after = Some(lit_str(&nv.lit, "after")),
                    "opt_in_group" => {
                        opts.opt_in_group = Some(lit_str(&nv.lit, "opt_in_group"))
                    }
                    other => panic!("nexus: unknown test option `{}`", other),
                }
            }
            _ => panic!("nexus: malformed test option"),
        }
    }
    opts
}

fn opt_tokens<T: quote::ToTokens>(o: Option<T>) -> proc_macro2::TokenStream {
    match o {
        Some(v) => quote! { ::core::option::Option::Some(#v) },
        None => quote! { ::core::option::Option::None },
    }
}

/// Registers a function as a nexus test case.
///
/// ```ignore
/// #[nexus::test]
/// fn push_pop() {
///     nexus::CHECK!(1 + 1 == 2);
/// }
///
/// #[nexus::test(seed = 42, should_fail)]
/// fn known_bad() {
///     nexus::CHECK!(false);
/// }
/// ```
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let opts = parse_test_opts(attr);
    let input = parse_macro_input!(item as ItemFn);
    let fn_name = input.sig.ident.clone();
    let fn_name_str = LitStr::new(&fn_name.to_string(), Span::call_site());
    let ctor_name =
        Ident::new(&format!("__nexus_register_{}", fn_name), Span::call_site());

    let exclusive = opts.exclusive;
    let should_fail = opts.should_fail;
    let endless = opts.endless;
    let disabled = opts.disabled;
    let debug = opts.debug;
    let verbose = opts.verbose;
    let seed = opt_tokens(opts.seed);
    let before = opt_tokens(opts.before.map(|s| LitStr::new(&s, Span::call_site())));
    let after = opt_tokens(opts.after.map(|s| LitStr::new(&s, Span::call_site())));
    let group = opt_tokens(
        opts.opt_in_group
            .map(|s| LitStr::new(&s, Span::call_site())),
    );

    let expanded = quote! {
        #input

        #[allow(non_snake_case)]
        fn #ctor_name() -> ::nexus::registry::TestRecord {
            ::nexus::registry::TestRecord::new(
                #fn_name_str,
                ::core::file!(),
                ::core::line!(),
                #fn_name,
            )
            .with_exclusive(#exclusive)
            .with_should_fail(#should_fail)
            .with_endless(#endless)
            .with_disabled(#disabled)
            .with_debug(#debug)
            .with_verbose(#verbose)
            .with_seed(#seed)
            .with_before(#before)
            .with_after(#after)
            .with_opt_in_group(#group)
        }

        ::nexus::inventory::submit! { ::nexus::registry::TestCtor(#ctor_name) }
    };
    expanded.into()
}

/// Registers a function as a nexus app: an alternative entry point selected
/// by name, forwarding residual argv.
#[proc_macro_attribute]
pub fn app(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    let fn_name = input.sig.ident.clone();
    let fn_name_str = LitStr::new(&fn_name.to_string(), Span::call_site());
    let ctor_name =
        Ident::new(&format!("__nexus_register_app_{}", fn_name), Span::call_site());

    let expanded = quote! {
        #input

        #[allow(non_snake_case)]
        fn #ctor_name() -> ::nexus::registry::AppRecord {
            ::nexus::registry::AppRecord::new(
                #fn_name_str,
                ::core::file!(),
                ::core::line!(),
                #fn_name,
            )
        }

        ::nexus::inventory::submit! { ::nexus::registry::AppCtor(#ctor_name) }
    };
    expanded.into()
}

fn expand_check(input: TokenStream, terminate: bool) -> TokenStream {
    use syn::{BinOp, Expr};

    let expr = parse_macro_input!(input as Expr);

    let (op_str, cmp): (&str, Option<(Box<Expr>, proc_macro2::TokenStream, Box<Expr>)>) =
        match &expr {
            Expr::Binary(bin) => match &bin.op {
                BinOp::Eq(_) => ("==", Some((bin.left.clone(), quote! { == }, bin.right.clone()))),
                BinOp::Ne(_) => ("!=", Some((bin.left.clone(), quote! { != }, bin.right.clone()))),
                BinOp::Lt(_) => ("<", Some((bin.left.clone(), quote! { < }, bin.right.clone()))),
                BinOp::Le(_) => ("<=", Some((bin.left.clone(), quote! { <= }, bin.right.clone()))),
                BinOp::Gt(_) => (">", Some((bin.left.clone(), quote! { > }, bin.right.clone()))),
                BinOp::Ge(_) => (">=", Some((bin.left.clone(), quote! { >= }, bin.right.clone()))),
                BinOp::And(_) | BinOp::Or(_) => {
                    return syn::Error::new_spanned(
                        &expr,
                        "nexus: CHECK!/REQUIRE! cannot decompose `&&`/`||`; split into \
                         multiple CHECK! calls so each comparison is checked independently",
                    )
                    .to_compile_error()
                    .into();
                }
                _ => ("", None),
            },
            _ => ("", None),
        };

    let expr_src = quote::quote!(#expr).to_string();

    let expanded = if let Some((lhs, op_tokens, rhs)) = cmp {
        let lhs_src = quote::quote!(#lhs).to_string();
        let rhs_src = quote::quote!(#rhs).to_string();
        quote! {
            {
                let __nx_lhs = #lhs;
                let __nx_rhs = #rhs;
                let __nx_pass = __nx_lhs #op_tokens __nx_rhs;
                ::nexus::check::check_cmp(
                    __nx_pass,
                    (&::nexus::check::Wrap(&__nx_lhs)).nexus_repr(),
                    #op_str,
                    (&::nexus::check::Wrap(&__nx_rhs)).nexus_repr(),
                    #lhs_src,
                    #rhs_src,
                    ::core::file!(),
                    ::core::line!(),
                    #terminate,
                )
            }
        }
    } else {
        quote! {
            {
                let __nx_val: bool = #expr;
                ::nexus::check::check_bool(
                    __nx_val,
                    (&::nexus::check::Wrap(&__nx_val)).nexus_repr(),
                    #expr_src,
                    ::core::file!(),
                    ::core::line!(),
                    #terminate,
                )
            }
        }
    };
    expanded.into()
}

/// Records one check (spec.md section 4.2). Decomposes a single binary
/// comparison (`==`, `!=`, `<`, `<=`, `>`, `>=`) into `(lhs, op, rhs,
/// is_true)`, or falls back to treating the whole expression as a boolean
/// predicate. `&&`/`||` forms are rejected at macro-expansion time, forcing
/// the user to write multiple `CHECK!`s.
#[allow(non_snake_case)]
#[proc_macro]
pub fn CHECK(input: TokenStream) -> TokenStream {
    expand_check(input, false)
}

/// Like `CHECK!`, but always raises the assertion-failure signal on a false
/// predicate regardless of the bus's `always_terminate` flag.
#[allow(non_snake_case)]
#[proc_macro]
pub fn REQUIRE(input: TokenStream) -> TokenStream {
    expand_check(input, true)
}
