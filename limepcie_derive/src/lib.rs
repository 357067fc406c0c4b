use proc_macro::TokenStream;
use quote::quote;
use syn::{
    parse_macro_input,
    DeriveInput,
};

#[proc_macro_derive(PacketSerde)]
/// Derived on a packed_struct to shim in our `Encode`/`Decode` methods on packed structs.
/// `Encode`, `Decode` and `PackedStruct` have to be in scope where this is used.
pub fn derive_packet_serde(tokens: TokenStream) -> TokenStream {
    let input = parse_macro_input!(tokens as DeriveInput);
    let name = input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let generated = quote! {
        impl #impl_generics Encode for #name #ty_generics #where_clause {
            type Frame = <Self as PackedStruct>::ByteArray;

            fn encode(&self) -> Result<Self::Frame, packed_struct::PackingError> {
                self.pack()
            }
        }

        impl #impl_generics Decode for #name #ty_generics #where_clause {
            type Frame = <Self as PackedStruct>::ByteArray;

            fn decode(frame: &Self::Frame) -> Result<Self, packed_struct::PackingError> {
                Self::unpack(frame)
            }
        }
    };
    TokenStream::from(generated)
}
