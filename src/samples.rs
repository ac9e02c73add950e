//! Fixed corpus of HL7 messages sent during a run.
//!
//! Segments are separated by carriage returns, as HL7 v2 requires.

/// A named sample message
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub name: &'static str,
    pub payload: &'static [u8],
}

/// Patient admission
pub const ADT_A01: &[u8] = b"MSH|^~\\&|SENDING_APP|SENDING_FACILITY|RECEIVING_APP|RECEIVING_FACILITY|20230401123000||ADT^A01|MSG00001|P|2.5\r\
EVN|A01|20230401123000\r\
PID|1||12345^^^MRN||DOE^JOHN^^^^||19800101|M||W|123 MAIN ST^^ANYTOWN^CA^12345||5551234|||||12345678\r\
NK1|1|DOE^JANE^^^^|SPOUSE|555-5678\r\
PV1|1|I|2000^2012^01||||004777^ATTEND^AARON^A|||SUR||||ADM|A0|";

/// Lab results
pub const ORU_R01: &[u8] = b"MSH|^~\\&|LAB|FACILITY|EHR|FACILITY|20230401123000||ORU^R01|MSG00002|P|2.5\r\
PID|1||12345^^^MRN||DOE^JOHN^^^^||19800101|M\r\
OBR|1||LAB123456|CBC^COMPLETE BLOOD COUNT^L|||20230401120000\r\
OBX|1|NM|WBC^LEUKOCYTES^L||10.5|10*3/uL|4.0-11.0|N|||F\r\
OBX|2|NM|HGB^HEMOGLOBIN^L||14.2|g/dL|13.5-17.5|N|||F";

/// Pharmacy order
pub const RDE_O11: &[u8] = b"MSH|^~\\&|PHARMACY|FACILITY|EHR|FACILITY|20230401123000||RDE^O11|MSG00003|P|2.5\r\
PID|1||12345^^^MRN||DOE^JOHN^^^^||19800101|M\r\
ORC|NW|ORD123456|||||^^^20230401^^R|\r\
RXE|AMOX500^AMOXICILLIN 500MG||500|MG|TAB|BID||||||30||SWALLOW||20230401|20230415\r\
RXR|||SWALLOW";

/// Admission with a corrupted header segment name
pub const ADT_A01_BAD_HEADER: &[u8] = b"MSG|^~\\&|SENDING_APP|SENDING_FACILITY|RECEIVING_APP|RECEIVING_FACILITY|20230401123000||ADT^A01|MSG00004|P|2.5\r\
EVN|A01|20230401123000\r\
PID|1||12345^^^MRN||DOE^JOHN^^^^||19800101|M";

/// The corpus, in send order
pub fn corpus() -> Vec<Sample> {
    vec![
        Sample {
            name: "ADT^A01",
            payload: ADT_A01,
        },
        Sample {
            name: "ORU^R01",
            payload: ORU_R01,
        },
        Sample {
            name: "RDE^O11",
            payload: RDE_O11,
        },
        Sample {
            name: "ADT^A01 (corrupted header)",
            payload: ADT_A01_BAD_HEADER,
        },
    ]
}
