// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemFn};

/// Marks a function as a redeploy scenario.
///
/// The function takes `ctx: &rdt_testcase::ScenarioContext` and has no return
/// type; its body may use `?` and `rdt_skip!`. The macro gives it an
/// `rdt_testcase::ScenarioOutcome` return type and registers it with the
/// scenario inventory under `module_path!()::<fn name>`.
#[proc_macro_attribute]
pub fn rdt_scenario(_attrib: TokenStream, input: TokenStream) -> TokenStream {
    let item_fn = parse_macro_input!(input as ItemFn);

    // Expanded at the call site, so `module_path!()` names the scenario's
    // own module.
    let fn_ident = item_fn.sig.ident.clone();
    let fn_name = fn_ident.to_string();
    let submit: proc_macro2::TokenStream = quote! {
        rdt_testcase::inventory_submit! {
            rdt_testcase::Scenario::new(
                module_path!(),
                #fn_name,
                rdt_testcase::ScenarioFunction { f: #fn_ident }
            )
        }
    };

    // Run the body as a closure returning `anyhow::Result<()>` and let
    // `ScenarioOutcome::from_result` sort errors into skips and failures.
    let fn_vis = item_fn.vis.clone();
    let fn_sig = item_fn.sig.clone();
    let fn_block = item_fn.block;
    let remade_fn = quote! {
        #fn_vis #fn_sig -> rdt_testcase::ScenarioOutcome {
            rdt_testcase::ScenarioOutcome::from_result(
                (|| -> rdt_testcase::Result<()> {
                    #fn_block
                    Ok(())
                })()
            )
        }
    };

    quote! {
        #remade_fn

        #submit
    }
    .into()
}
