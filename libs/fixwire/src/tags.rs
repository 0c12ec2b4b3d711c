//! FIX tag numbers and symbolic names consumed by the gateway.

/// SOH (Start of Header) field delimiter.
pub const SOH: char = '\u{1}';

pub const BEGIN_STRING: u32 = 8;
pub const BODY_LENGTH: u32 = 9;
pub const CHECK_SUM: u32 = 10;
pub const CL_ORD_ID: u32 = 11;
pub const MSG_SEQ_NUM: u32 = 34;
pub const MSG_TYPE: u32 = 35;
pub const ORDER_QTY: u32 = 38;
pub const ORD_TYPE: u32 = 40;
pub const PRICE: u32 = 44;
pub const SENDER_COMP_ID: u32 = 49;
pub const SENDING_TIME: u32 = 52;
pub const SIDE: u32 = 54;
pub const SYMBOL: u32 = 55;
pub const TARGET_COMP_ID: u32 = 56;
pub const TIME_IN_FORCE: u32 = 59;

/// Symbolic name for a FIX tag, if the gateway knows one.
///
/// Unknown tags have no symbolic name; callers fall back to `Tag<N>`.
pub fn tag_name(tag: u32) -> Option<&'static str> {
    match tag {
        BEGIN_STRING => Some("BeginString"),
        BODY_LENGTH => Some("BodyLength"),
        CHECK_SUM => Some("CheckSum"),
        CL_ORD_ID => Some("ClOrdID"),
        MSG_SEQ_NUM => Some("MsgSeqNum"),
        MSG_TYPE => Some("MsgType"),
        ORDER_QTY => Some("OrderQty"),
        ORD_TYPE => Some("OrdType"),
        PRICE => Some("Price"),
        SENDER_COMP_ID => Some("SenderCompID"),
        SENDING_TIME => Some("SendingTime"),
        SIDE => Some("Side"),
        SYMBOL => Some("Symbol"),
        TARGET_COMP_ID => Some("TargetCompID"),
        TIME_IN_FORCE => Some("TimeInForce"),
        _ => None,
    }
}
