use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{Ident, ItemFn, parse_macro_input, spanned::Spanned};

/// Implementation of the `#[controller]` attribute macro.
///
/// Leaves the decorated factory unchanged and appends a
/// `#[::warren_framework::linkme::distributed_slice]` static that wires it
/// into `warren_framework::CONTROLLERS`.
pub fn controller(attr: TokenStream, item: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        let attr = proc_macro2::TokenStream::from(attr);
        return syn::Error::new(attr.span(), "#[controller] takes no arguments")
            .into_compile_error()
            .into();
    }

    let func = parse_macro_input!(item as ItemFn);
    if let Err(err) = check_signature(&func) {
        return err.into_compile_error().into();
    }

    let fn_name = &func.sig.ident;
    let fn_name_upper = fn_name.to_string().to_uppercase();
    let static_name = Ident::new(
        &format!("_CONTROLLER_REGISTER_{fn_name_upper}"),
        Span::call_site(),
    );

    quote! {
        #func

        #[::warren_framework::linkme::distributed_slice(::warren_framework::CONTROLLERS)]
        #[linkme(crate = ::warren_framework::linkme)]
        static #static_name: fn() -> ::warren_framework::Controller = #fn_name;
    }
    .into()
}

fn check_signature(func: &ItemFn) -> syn::Result<()> {
    let sig = &func.sig;
    if let Some(asyncness) = sig.asyncness {
        return Err(syn::Error::new(
            asyncness.span(),
            "controller factories must not be async",
        ));
    }
    if !sig.inputs.is_empty() {
        return Err(syn::Error::new(
            sig.inputs.span(),
            "controller factories take no arguments",
        ));
    }
    if !sig.generics.params.is_empty() {
        return Err(syn::Error::new(
            sig.generics.span(),
            "controller factories cannot be generic",
        ));
    }
    if matches!(sig.output, syn::ReturnType::Default) {
        return Err(syn::Error::new(
            sig.ident.span(),
            "controller factories must return a Controller",
        ));
    }
    Ok(())
}
