extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro2::{Ident, Span};
use quote::quote;

#[derive(Default)]
struct Options {
    crate_name: Option<Ident>,
    parallelism: Option<usize>,
}

impl Options {
    fn crate_name(&mut self, lit: syn::Lit) -> Result<(), syn::Error> {
        let span = lit.span();
        if self.crate_name.is_some() {
            return Err(syn::Error::new(span, "crate name already set"));
        }
        let syn::Lit::Str(s) = lit else {
            return Err(syn::Error::new(span, "crate name should be string literal"));
        };
        match s.parse::<syn::Path>().ok().as_ref().and_then(|path| path.get_ident()) {
            Some(ident) => {
                self.crate_name = Some(ident.clone());
                Ok(())
            },
            None => Err(syn::Error::new(span, format!("invalid crate name: {}", s.value()))),
        }
    }

    fn parallelism(&mut self, lit: syn::Lit) -> Result<(), syn::Error> {
        let span = lit.span();
        if self.parallelism.is_some() {
            return Err(syn::Error::new(span, "parallelism already set"));
        }
        match lit {
            syn::Lit::Int(lit) if lit.base10_parse::<usize>()? > 0 => {
                self.parallelism = Some(lit.base10_parse::<usize>()?);
                Ok(())
            },
            _ => Err(syn::Error::new(span, "parallelism should be positive integer")),
        }
    }

    fn parse(args: syn::AttributeArgs) -> Result<Options, syn::Error> {
        let mut options = Options::default();
        for arg in args.into_iter() {
            let syn::NestedMeta::Meta(syn::Meta::NameValue(name_value)) = arg else {
                return Err(syn::Error::new_spanned(arg, "unknown attribute"));
            };
            let Some(ident) = name_value.path.get_ident() else {
                return Err(syn::Error::new_spanned(&name_value, "invalid attribute name"));
            };
            match ident.to_string().as_str() {
                "parallelism" => options.parallelism(name_value.lit)?,
                "crate" => options.crate_name(name_value.lit)?,
                _ => return Err(syn::Error::new_spanned(&name_value, "unknown attribute name")),
            }
        }
        Ok(options)
    }
}

fn generate(is_test: bool, attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = syn::parse_macro_input!(attr as syn::AttributeArgs);
    let options = match Options::parse(args) {
        Ok(options) => options,
        Err(err) => return TokenStream::from(err.into_compile_error()),
    };
    let input = syn::parse_macro_input!(item as syn::ItemFn);

    let ret = &input.sig.output;
    let inputs = &input.sig.inputs;
    let name = &input.sig.ident;
    let body = &input.block;
    let attrs = &input.attrs;
    let vis = &input.vis;

    let macro_name = if is_test { "#[unstuck::test]" } else { "#[unstuck::main]" };

    if input.sig.asyncness.is_none() {
        let err = syn::Error::new_spanned(input, format!("only async function can be tagged with {}", macro_name));
        return TokenStream::from(err.into_compile_error());
    }

    if !is_test && name != "main" {
        let err = syn::Error::new_spanned(name, "only the main function can be tagged with #[unstuck::main]");
        return TokenStream::from(err.into_compile_error());
    }

    if inputs.len() > 1 {
        let err = syn::Error::new_spanned(inputs, format!("{} accepts at most one coroutine context argument", macro_name));
        return TokenStream::from(err.into_compile_error());
    }

    let header = if is_test {
        quote! {
            #[::core::prelude::v1::test]
        }
    } else {
        quote! {}
    };

    let closure_inputs = if inputs.is_empty() { quote! { _ } } else { quote! { #inputs } };
    let crate_name = options.crate_name.unwrap_or_else(|| Ident::new("unstuck", Span::call_site()));
    let parallelism = options.parallelism.unwrap_or(0);
    let result = quote! {
        #header
        #(#attrs)*
        #vis fn #name() #ret {
            let mut builder = #crate_name::runtime::Builder::default();
            if #parallelism != 0 {
                builder.parallelism(#parallelism);
            }
            let runtime = builder.build();
            runtime.block_on(move |#closure_inputs| async move #body).unwrap()
        }
    };

    result.into()
}

/// Runs marked async main function to completion in a configured runtime.
///
/// The function may take one argument which receives the coroutine context.
///
/// ## Options
/// * `parallelism`: positive integer to specify worker threads of runtime
///
/// ## Examples
/// ```rust
/// #[unstuck::main]
/// async fn main(co: unstuck::Co) {
///     let five = co.run(unstuck::task(|_| async { 5 })).await.unwrap();
///     assert_eq!(five, 5);
/// }
/// ```
///
/// ```rust
/// #[unstuck::main(parallelism = 1)]
/// async fn main() {
///     println!("hello");
/// }
/// ```
#[cfg(not(test))]
#[proc_macro_attribute]
pub fn main(attr: TokenStream, item: TokenStream) -> TokenStream {
    generate(false, attr, item)
}

/// Runs marked async test function in a configured runtime.
///
/// See [macro@main] for configurable options.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    generate(true, attr, item)
}
