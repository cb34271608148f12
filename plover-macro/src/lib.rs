//! # Plover Procedural Macros
//!
//! ## `#[service]` Macro
//!
//! Turns a trait into an RPC service. It generates:
//! - a `plover_export` method registering every method with a `Router`
//! - implementations of the trait on `plover::Client` and `plover::XClient`
//!   that call the remote service
//!
//! ### Example
//!
//! ```rust,ignore
//! #[plover::service]
//! pub trait Arith {
//!     async fn multiply(&self, ctx: &Context, req: &Args) -> Result<i64>;
//! }
//! ```
//!
//! The wire name of `multiply` above is `"Arith.Multiply"`.
//!
//! ### Requirements
//!
//! Service methods must look like
//! `async fn method_name(&self, ctx: &Context, req: &Req) -> Result<Rsp>`
//! where `Result` is `plover::Result`. The generated trait returns
//! `impl Future<Output = ...> + Send`; implementations may keep using
//! `async fn`.

use proc_macro::TokenStream;
use quote::quote;
use syn::{FnArg, ItemTrait, ReturnType, TraitItem, Type, parse_macro_input};

/// Defines an RPC service.
///
/// # Panics
///
/// Panics at compile time if:
/// - a method doesn't match the required signature
/// - a method is named `plover_export` (reserved)
#[proc_macro_attribute]
pub fn service(_attr: TokenStream, input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as ItemTrait);

    let trait_ident = &input.ident;
    let visibility = &input.vis;
    let trait_attrs = &input.attrs;
    let trait_name = trait_ident.to_string();

    let mut trait_methods = vec![];
    let mut export_branchs = vec![];
    let mut client_methods = vec![];

    let krate = get_crate_name();

    for item in &input.items {
        if let TraitItem::Fn(method) = item
            && method.sig.inputs.len() == 3
            && method.sig.asyncness.is_some()
            && method.default.is_none()
            && let Some(receiver) = method.sig.receiver()
            && let FnArg::Typed(ctx_arg) = &method.sig.inputs[1]
            && let FnArg::Typed(req_arg) = &method.sig.inputs[2]
            && let Type::Reference(req_ref) = &*req_arg.ty
            && let ReturnType::Type(_, rsp_type) = &method.sig.output
        {
            let method_ident = &method.sig.ident;
            if *method_ident == "plover_export" {
                panic!("the function cannot be named `plover_export`!");
            }
            let method_name = to_upper_camel(&method_ident.to_string());
            let service_method = format!("{trait_name}.{method_name}");

            let attrs = &method.attrs;
            let ctx_type = &ctx_arg.ty;
            let req_type = &req_arg.ty;
            let owned_req_type = &req_ref.elem;

            trait_methods.push(quote! {
                #(#attrs)*
                fn #method_ident(#receiver, ctx: #ctx_type, req: #req_type)
                    -> impl ::std::future::Future<Output = #rsp_type> + Send;
            });

            client_methods.push(quote! {
                fn #method_ident(#receiver, ctx: #ctx_type, req: #req_type)
                    -> impl ::std::future::Future<Output = #rsp_type> + Send
                {
                    self.call(ctx, #service_method, req)
                }
            });

            export_branchs.push(quote! {
                let this = self.clone();
                service.add_method(#method_name, move |ctx: #krate::Context, req: #owned_req_type| {
                    let this = this.clone();
                    async move { this.#method_ident(&ctx, &req).await }
                })?;
            });
        } else {
            panic!(
                "the function should be in the form `async fn func(&self, ctx: &Context, req: &Req) -> Result<Rsp>`."
            );
        }
    }

    quote! {
        #(#trait_attrs)*
        #visibility trait #trait_ident {
            const NAME: &'static str = #trait_name;

            #(#trait_methods)*

            fn plover_export(
                self: ::std::sync::Arc<Self>,
                router: &mut #krate::Router,
            ) -> #krate::Result<()>
            where
                Self: 'static + Send + Sync,
            {
                let mut service = #krate::Service::new(#trait_name);
                #(#export_branchs)*
                router.add_service(service)
            }
        }

        impl #trait_ident for #krate::Client {
            #(#client_methods)*
        }

        impl #trait_ident for #krate::XClient {
            #(#client_methods)*
        }
    }
    .into()
}

/// `snake_case` method identifiers become `UpperCamel` wire names.
fn to_upper_camel(ident: &str) -> String {
    ident
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect()
            })
        })
        .collect()
}

/// Path to the plover crate as seen from the expansion site.
pub(crate) fn get_crate_name() -> proc_macro2::TokenStream {
    match proc_macro_crate::crate_name("plover") {
        Ok(proc_macro_crate::FoundCrate::Name(name)) => {
            let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
            quote! { ::#ident }
        }
        _ => quote! { ::plover },
    }
}

#[cfg(test)]
mod tests {
    use super::to_upper_camel;

    #[test]
    fn test_to_upper_camel() {
        assert_eq!(to_upper_camel("double"), "Double");
        assert_eq!(to_upper_camel("slow_sum"), "SlowSum");
        assert_eq!(to_upper_camel("get_v2_id"), "GetV2Id");
    }
}
