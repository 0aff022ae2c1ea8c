//! Proc macros for proxy-e2e
//!
//! Provides the `#[proxy_e2e::test]` attribute macro for scenario tests.

use proc_macro::TokenStream;
use quote::quote;
use syn::{FnArg, ItemFn, Pat, PatType, ReturnType};

/// Attribute macro for scenario tests.
///
/// Builds a `Suite` from the environment and injects it into your test
/// function as `suite`. Logging is initialized first.
///
/// # Example
///
/// ```ignore
/// use proxy_e2e::prelude::*;
///
/// #[proxy_e2e::test]
/// #[ignore]
/// async fn no_rbac(suite: Suite) {
///     suite
///         .scenario("NoRBAC", "...")
///         .then(run_fails("kube-rbac-proxy-client", shell("curl --fail ...")))
///         .run()
///         .await
///         .unwrap();
/// }
/// ```
///
/// # With Result Return Type
///
/// ```ignore
/// #[proxy_e2e::test]
/// #[ignore]
/// async fn no_rbac(suite: Suite) -> Result<(), ScenarioError> {
///     suite.scenario("NoRBAC", "...").run().await
/// }
/// ```
///
/// An `Err` fails the test with the error's `Display` output, so a
/// `ScenarioError` prints its full diagnostic block.
///
/// # Environment Variables
///
/// Everything `SuiteConfig::from_env` reads, plus `RUST_LOG`.
#[proc_macro_attribute]
pub fn test(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input_fn = syn::parse_macro_input!(item as ItemFn);
    test_impl(&input_fn).into()
}

/// Check if a function has a parameter named "suite"
fn has_suite_param(input_fn: &ItemFn) -> bool {
    input_fn.sig.inputs.iter().any(|arg| {
        if let FnArg::Typed(PatType { pat, .. }) = arg {
            if let Pat::Ident(ident) = pat.as_ref() {
                return ident.ident == "suite";
            }
        }
        false
    })
}

/// Inner implementation that works with `proc_macro2` types for testability
fn test_impl(input_fn: &ItemFn) -> proc_macro2::TokenStream {
    let fn_name = &input_fn.sig.ident;
    let fn_block = &input_fn.block;
    let fn_vis = &input_fn.vis;
    let fn_attrs = &input_fn.attrs;

    let body = match &input_fn.sig.output {
        ReturnType::Type(_, ret_ty) => quote! {
            let result: #ret_ty = async move #fn_block.await;
            if let Err(e) = result {
                panic!("{}", e);
            }
        },
        ReturnType::Default => quote! {
            async move #fn_block.await;
        },
    };

    if has_suite_param(input_fn) {
        quote! {
            #(#fn_attrs)*
            #[tokio::test]
            #fn_vis async fn #fn_name() {
                ::proxy_e2e::telemetry::init_logging();

                let suite = ::proxy_e2e::Suite::from_env()
                    .await
                    .unwrap_or_else(|e| panic!("Failed to build Suite: {}", e));

                #body
            }
        }
    } else {
        // No suite parameter - just wrap with tokio::test
        quote! {
            #(#fn_attrs)*
            #[tokio::test]
            #fn_vis async fn #fn_name() {
                ::proxy_e2e::telemetry::init_logging();

                #body
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{has_suite_param, test_impl};
    use syn::ItemFn;

    fn parse_fn(code: &str) -> ItemFn {
        syn::parse_str(code).expect("Failed to parse test function")
    }

    #[test]
    fn test_has_suite_param_with_suite() {
        let f = parse_fn("async fn test_it(suite: Suite) {}");
        assert!(has_suite_param(&f));
    }

    #[test]
    fn test_has_suite_param_without_suite() {
        let f = parse_fn("async fn test_it() {}");
        assert!(!has_suite_param(&f));
    }

    #[test]
    fn test_has_suite_param_different_name() {
        let f = parse_fn("async fn test_it(s: Suite) {}");
        assert!(!has_suite_param(&f), "Only 'suite' name should match");
    }

    #[test]
    fn test_impl_with_suite_builds_from_env() {
        let f = parse_fn("async fn no_rbac(suite: Suite) { suite.scenario(\"a\", \"b\"); }");
        let output = test_impl(&f).to_string();

        assert!(output.contains("Suite :: from_env"), "Should build Suite");
        assert!(output.contains("tokio :: test"), "Should have tokio::test");
        assert!(output.contains("init_logging"), "Should initialize logging");
    }

    #[test]
    fn test_impl_with_result_panics_on_err() {
        let f = parse_fn(
            "async fn no_rbac(suite: Suite) -> Result<(), ScenarioError> { Ok(()) }",
        );
        let output = test_impl(&f).to_string();

        assert!(
            output.contains("Result < () , ScenarioError >"),
            "Should keep the declared return type for `?`"
        );
        assert!(output.contains("panic !"), "Should fail the test on Err");
    }

    #[test]
    fn test_impl_without_suite_generates_simple_wrapper() {
        let f = parse_fn("async fn test_simple() { assert!(true); }");
        let output = test_impl(&f).to_string();

        assert!(output.contains("tokio :: test"), "Should have tokio::test");
        assert!(
            !output.contains("from_env"),
            "Should NOT build a Suite without suite param"
        );
    }

    #[test]
    fn test_impl_preserves_function_name_and_attrs() {
        let f = parse_fn("#[ignore] async fn with_allow_path(suite: Suite) {}");
        let output = test_impl(&f).to_string();

        assert!(output.contains("with_allow_path"));
        assert!(output.contains("ignore"));
    }
}
