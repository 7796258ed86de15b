//! Derive macro for the `Visit` trait.
//!
//! `#[derive(Visit)]` walks every field of a client payload struct or enum and
//! forwards it to `Visit::visit_values`, so the collector sees each `Value`
//! slot the payload holds, including nested arrays and structs.

use proc_macro2::TokenStream;
use quote::{format_ident, quote, quote_spanned};
use syn::{
    parse_macro_input, parse_quote, spanned::Spanned, Data, DeriveInput, Fields, GenericParam,
    Generics, Ident, Index, Path,
};

#[proc_macro_derive(Visit, attributes(nyaa_heap))]
pub fn derive_visit(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let mut nyaa_heap: Path = parse_quote!(::nyaa_heap);

    for attr in &input.attrs {
        if !attr.path().is_ident("nyaa_heap") {
            continue;
        }

        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                nyaa_heap = meta.value()?.parse()?;
                Ok(())
            } else {
                Err(meta.error("unsupported attribute"))
            }
        });

        if let Err(err) = result {
            return err.into_compile_error().into();
        }
    }

    let name = &input.ident;
    let generics = add_trait_bounds(&nyaa_heap, input.generics);
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();
    let visit_body = generate_visit_body(&nyaa_heap, name, &input.data);

    let generated = quote! {
        unsafe impl #impl_generics #nyaa_heap::Visit for #name #ty_generics #where_clause {
            #[inline]
            fn visit_values(&mut self, visitor: &mut dyn FnMut(&mut #nyaa_heap::Value)) {
                #visit_body
            }
        }
    };

    generated.into()
}

fn add_trait_bounds(nyaa_heap: &Path, mut generics: Generics) -> Generics {
    for param in &mut generics.params {
        if let GenericParam::Type(ref mut type_param) = *param {
            let has_visit = type_param.bounds.iter().any(|b| {
                if let syn::TypeParamBound::Trait(t) = b {
                    t.path.segments.last().is_some_and(|s| s.ident == "Visit")
                } else {
                    false
                }
            });

            if !has_visit {
                type_param.bounds.push(parse_quote!(#nyaa_heap::Visit));
            }
        }
    }
    generics
}

fn generate_visit_body(nyaa_heap: &Path, name: &Ident, data: &Data) -> TokenStream {
    match data {
        Data::Struct(data) => generate_struct_visit(nyaa_heap, &data.fields),
        Data::Enum(data) => generate_enum_visit(nyaa_heap, name, data),
        Data::Union(u) => {
            quote_spanned! {
                u.union_token.span => compile_error!("`Visit` must be manually implemented for unions");
            }
        }
    }
}

fn generate_struct_visit(nyaa_heap: &Path, fields: &Fields) -> TokenStream {
    match fields {
        Fields::Named(f) => {
            let calls = f.named.iter().map(|field| {
                let name = &field.ident;
                quote_spanned! {field.span() =>
                    #nyaa_heap::Visit::visit_values(&mut self.#name, visitor);
                }
            });
            quote! { #(#calls)* }
        }
        Fields::Unnamed(f) => {
            let calls = f.unnamed.iter().enumerate().map(|(i, field)| {
                let index = Index::from(i);
                quote_spanned! {field.span() =>
                    #nyaa_heap::Visit::visit_values(&mut self.#index, visitor);
                }
            });
            quote! { #(#calls)* }
        }
        Fields::Unit => quote! {},
    }
}

fn generate_enum_visit(nyaa_heap: &Path, name: &Ident, data: &syn::DataEnum) -> TokenStream {
    let match_arms = data.variants.iter().map(|variant| {
        let var_name = &variant.ident;
        match &variant.fields {
            Fields::Named(f) => {
                let field_names: Vec<_> = (0..f.named.len())
                    .map(|i| format_ident!("field{}", i))
                    .collect();
                let field_idents = f.named.iter().filter_map(|f| f.ident.as_ref());
                let calls = field_names.iter().map(|field| {
                    quote! { #nyaa_heap::Visit::visit_values(#field, visitor); }
                });

                quote! {
                    #name::#var_name { #(#field_idents: #field_names),* } => {
                        #(#calls)*
                    }
                }
            }
            Fields::Unnamed(f) => {
                let field_names: Vec<_> = (0..f.unnamed.len())
                    .map(|i| format_ident!("field{}", i))
                    .collect();
                let calls = field_names.iter().map(|field| {
                    quote! { #nyaa_heap::Visit::visit_values(#field, visitor); }
                });

                quote! {
                    #name::#var_name(#(#field_names),*) => {
                        #(#calls)*
                    }
                }
            }
            Fields::Unit => {
                quote! {
                    #name::#var_name => {}
                }
            }
        }
    });

    quote! {
        match self {
            #(#match_arms)*
        }
    }
}
