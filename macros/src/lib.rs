use proc_macro2::{Spacing, Span, TokenTree};
use quote::quote;
use syn::{parse_macro_input, Data, DataEnum, DataUnion, DeriveInput, Error, Meta, MetaList};

/// Derives `utils::bytes::Cast` and `utils::bytes::Unaligned` for a wire-format struct.
///
/// The struct must be `repr(C)` (optionally `packed`) or `repr(transparent)`, must not be
/// generic, and every field must itself be `Cast + Unaligned`. A compile-time assertion
/// checks that the field sizes sum to the struct size, so no padding can sneak in.
#[proc_macro_derive(Cast)]
pub fn bytes(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
	let DeriveInput { attrs, ident: name, generics, data, .. } = parse_macro_input!(item as DeriveInput);

	// Whether one of "C" or "transparent" has been seen.
	let mut base = false;

	for attr in attrs {
		if let Meta::List(MetaList { path, tokens, .. }) = attr.meta {
			if path.is_ident("repr") {
				let mut last_was_delim = true;

				for token in tokens.into_iter() {
					match token {
						TokenTree::Punct(punct) if !last_was_delim && punct.as_char() == ',' && punct.spacing() == Spacing::Alone => {
							last_was_delim = true;
							continue;
						}
						TokenTree::Ident(ident) if last_was_delim && (ident == "C" || ident == "transparent") => base = true,
						TokenTree::Ident(ident) if last_was_delim && ident == "packed" => {}
						_ => return Error::new(token.span(), "Unexpected token").to_compile_error().into(),
					}

					last_was_delim = false;
				}
			}
		}
	}

	if !base {
		return Error::new(Span::call_site(), "Struct needs explicit repr(C) or repr(transparent)")
			.to_compile_error()
			.into();
	};

	if !generics.params.is_empty() {
		return Error::new(Span::call_site(), "Generic structs are not supported.").to_compile_error().into();
	}

	let fields = match data {
		Data::Struct(obj) => obj.fields.into_iter().map(|field| field.ty).collect::<Vec<_>>(),
		Data::Enum(DataEnum { enum_token, .. }) => return Error::new_spanned(enum_token, "Enums are not supported.").to_compile_error().into(),
		Data::Union(DataUnion { union_token, .. }) => return Error::new_spanned(union_token, "Unions are not supported.").to_compile_error().into(),
	};

	quote! {
		const _: () = {
			// Every field must be castable and free of alignment requirements on its own.
			fn _field<T: ::utils::bytes::Cast + ::utils::bytes::Unaligned>() {}
			fn _fields() { #( _field::<#fields>(); )* }
			// The field sizes must cover the struct exactly, leaving no room for padding.
			::core::assert!(::core::mem::size_of::<#name>() == 0 #( + ::core::mem::size_of::<#fields>() )*);
			::core::assert!(::core::mem::align_of::<#name>() == 1);
		};

		unsafe impl ::utils::bytes::Cast for #name {}
		unsafe impl ::utils::bytes::Unaligned for #name {}
	}
	.into()
}
