// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Attribute macro backing `test_with_tracing::test`.

use quote::quote;
use syn::parse_macro_input;
use syn::spanned::Spanned;
use syn::Error;
use syn::ItemFn;

/// Marks a function as a test that emits `tracing` output.
///
/// Behaves like the built-in `#[test]` attribute, but installs the test
/// subscriber before the body runs. Other attributes on the function (such as
/// `#[should_panic]` or `#[ignore]`) are passed through unchanged.
#[proc_macro_attribute]
pub fn test(
    _attr: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let item = parse_macro_input!(item as ItemFn);
    expand(item)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

fn expand(item: ItemFn) -> syn::Result<proc_macro2::TokenStream> {
    let sig = &item.sig;
    if let Some(asyncness) = sig.asyncness {
        return Err(Error::new(asyncness.span(), "tests cannot be async"));
    }
    if !sig.generics.params.is_empty() {
        return Err(Error::new(sig.generics.span(), "tests cannot be generic"));
    }
    if !sig.inputs.is_empty() {
        return Err(Error::new(sig.inputs.span(), "tests take no arguments"));
    }

    let name = &sig.ident;
    let output = &sig.output;
    let attrs = &item.attrs;
    let vis = &item.vis;
    let inner_sig = &item.sig;
    let body = &item.block;

    Ok(quote! {
        #[::core::prelude::v1::test]
        #(#attrs)*
        #vis fn #name() #output {
            #inner_sig #body
            ::test_with_tracing::init();
            #name()
        }
    })
}
